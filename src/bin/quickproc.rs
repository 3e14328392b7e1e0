use log::trace;
use quickproc::{cli::main_with_args, logging::init_logger};
use std::env;

fn main() {
    init_logger();
    trace!("start main");
    let retcode = main_with_args(env::args());
    trace!("end main");
    std::process::exit(retcode);
}
