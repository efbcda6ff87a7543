#[cfg(feature = "mimalloc")]
#[global_allocator]
static MIMALLOC: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() {
    if let Err(error) = run() {
        libmold::error::report_error_and_exit(&error);
    }
}

fn run() -> libmold::error::Result {
    let linker = libmold::Linker::from_args(std::env::args().skip(1))?;
    linker.run()
}
