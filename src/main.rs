use std::process::ExitCode;

fn main() -> ExitCode {
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Cannot start runtime: {}", err);
            return ExitCode::FAILURE;
        }
    };
    return match runtime.block_on(tracedig::tracedig_main_async(std::env::args_os())) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{:#}", err);
            ExitCode::FAILURE
        }
    };
}
