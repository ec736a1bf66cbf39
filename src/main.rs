fn main() {
    if let Err(err) = ccd_harmonize::run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
