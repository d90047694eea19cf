fn main() {
    if let Err(err) = jrnl_today::cli::run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
