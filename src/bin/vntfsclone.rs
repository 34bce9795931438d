use virtpart::cli;
use virtpart::probe::Format;

fn main() {
    std::process::exit(cli::run(Format::NtfsClone));
}
