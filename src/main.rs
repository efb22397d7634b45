fn main() {
    if let Err(err) = backupkit::cli::run() {
        eprintln!("{:#}", err);
        std::process::exit(1);
    }
}
