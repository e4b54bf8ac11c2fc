use oz_init::{app, handshake, supervisor};
use tracing::error;

fn main() {
    oz_init::logging::init();

    if let Err(e) = run() {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn run() -> oz_init::Result<()> {
    // Block the supervised signals before any thread exists; the reaper
    // and signal threads collect them with sigwait.
    supervisor::block_signals()?;

    let stdin = std::io::stdin();
    let data = handshake::read_handshake(stdin.lock())?;
    data.validate(
        nix::unistd::geteuid().as_raw(),
        nix::unistd::getpid().as_raw(),
    )?;

    app::run(data)
}
