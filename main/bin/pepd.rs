use std::process::ExitCode;

fn main() -> ExitCode {
    let result = pepd::core::main::run_pepd();
    log::logger().flush();

    if let Err(e) = result {
        // log the full error and its context chain
        if log::log_enabled!(log::Level::Error) {
            for line in format!("{:?}", e).split('\n') {
                log::error!("{}", line);
            }
            log::logger().flush();

            // print the short error
            eprintln!("** pepd did not complete successfully: {}", e);
            eprintln!("**   {}", e.root_cause());
            eprintln!("** See the log for details");
        } else {
            // logging may not be configured yet, so print to stderr
            eprintln!("{:?}", e);
        }

        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
