fn main() {
    if let Err(err) = tabular_ingest::run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
