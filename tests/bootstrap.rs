//! Exercises the real `childproc-helperd` binary's bootstrap sequence: listening on a socket
//! path, spawning the helper pointed at it, and checking the 4-byte greeting.

use std::io::Read;
use std::os::unix::net::UnixListener;
use std::process::Command;
use std::time::Duration;

#[test]
fn helper_connects_and_sends_greeting() {
    let dir = tempfile::tempdir().expect("tempdir");
    let socket_path = dir.path().join("helper.sock");
    let listener = UnixListener::bind(&socket_path).expect("bind");

    let mut child = Command::new(env!("CARGO_BIN_EXE_childproc-helperd"))
        .arg(&socket_path)
        .spawn()
        .expect("spawn helper");

    listener
        .set_nonblocking(false)
        .expect("blocking listener");
    let (mut conn, _) = listener.accept().expect("accept from helper");

    conn.set_read_timeout(Some(Duration::from_secs(5))).expect("set timeout");
    let mut greeting = [0u8; 4];
    conn.read_exact(&mut greeting).expect("read greeting");
    assert_eq!(greeting, childproc_helperd::protocol::GREETING);

    drop(conn); // closing the main channel asks the helper to shut down
    let status = child.wait().expect("wait for helper");
    assert!(status.success(), "helper exited with {status:?}");
}
