use clap::Parser;

fn main() {
    let cli = shiftcastctl::Cli::parse();
    if let Err(err) = shiftcastctl::run(cli) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
