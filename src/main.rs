fn main() {
    if let Err(err) = figure_exporter::run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
