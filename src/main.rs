fn main() {
    if let Err(e) = xds_translator::cli::run_cli() {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
