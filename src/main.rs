fn main() {
    if let Err(err) = snapnote_lib::run() {
        log::error!("Snapnote failed: {err:#}");
        eprintln!("snapnote: {err:#}");
        std::process::exit(1);
    }
}
