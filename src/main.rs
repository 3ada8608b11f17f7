use perch::app::{self, Invocation};

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = match app::parse_args(&args) {
        Ok(Invocation::Version) => {
            println!("perch {}", perch::VERSION);
            return;
        }
        Ok(Invocation::Help) => {
            println!("{}", app::USAGE);
            return;
        }
        Ok(Invocation::Run(command)) => command,
        Err(message) => {
            eprintln!("error: {message}\n\n{}", app::USAGE);
            std::process::exit(2);
        }
    };

    if let Err(err) = app::run(command).await {
        eprintln!("error: {err:?}");
        std::process::exit(1);
    }
}
