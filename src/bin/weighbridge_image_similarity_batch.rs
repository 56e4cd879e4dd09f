use weighbridge_similarity::cli;

fn main() {
    std::process::exit(cli::main_with(cli::run_batch, true));
}
