use worker_launch::cli;
use worker_launch::worker::StandbyApp;

fn main() {
    let argv: Vec<String> = std::env::args_os()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect();
    std::process::exit(cli::launch(argv, &StandbyApp));
}
