//! Helpers for tests that need a local mock upstream.

/// True when the sandbox refuses loopback listeners, in which case mock-server
/// tests return early instead of failing.
pub fn should_skip_httpmock() -> bool {
    match std::net::TcpListener::bind(("127.0.0.1", 0)) {
        Ok(_) => false,
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
            eprintln!("skipping mock upstream test: loopback bind denied");
            true
        }
        Err(err) => panic!("cannot bind loopback for mock upstream: {err}"),
    }
}
