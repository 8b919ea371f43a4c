use std::process;

fn main() {
    process::exit(knit::cli::run());
}
