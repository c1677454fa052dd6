//! Entry point: parses the command line, connects back to the client, and hands the connection
//! to the [`Service`] main loop.

use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;

use clap::Parser;
use log::error;

use childproc_helperd::config::Config;
use childproc_helperd::protocol::GREETING;
use childproc_helperd::service::Service;

fn main() {
    let config = Config::parse();

    let env = env_logger::Env::default().default_filter_or(config.default_log_filter());
    env_logger::Builder::from_env(env).init();

    match run(config) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("bootstrap failed: {e}");
            std::process::exit(1);
        }
    }
}

fn run(config: Config) -> std::io::Result<i32> {
    let stream = UnixStream::connect(&config.socket_path)?;
    stream.set_nonblocking(false)?;

    // The 4-byte greeting tells the client this is a live helper speaking the expected protocol
    // version, before any subchannel traffic begins.
    {
        use std::io::Write;
        (&stream).write_all(&GREETING)?;
    }

    // Stdin is of no further use to the helper; closing it matches the bootstrap contract and
    // avoids holding open whatever the client's process spawned us with as fd 0.
    unsafe {
        libc::close(libc::STDIN_FILENO);
    }

    let main_channel_fd = {
        use std::os::fd::{FromRawFd, OwnedFd};
        let raw = stream.as_raw_fd();
        std::mem::forget(stream);
        unsafe { OwnedFd::from_raw_fd(raw) }
    };

    let service = Service::initialize(main_channel_fd)?;
    Ok(service.run())
}
