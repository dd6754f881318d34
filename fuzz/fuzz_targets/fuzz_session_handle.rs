#![no_main]

use faceshot_client::protocol::ServerMessage;
use faceshot_client::{Session, SessionState};
use libfuzzer_sys::fuzz_target;

// Feed newline-separated arbiter frames to a connected session.
fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let mut session = Session::new();
    session.connected();

    for line in text.lines() {
        let Ok(msg) = serde_json::from_str::<ServerMessage>(line) else {
            continue;
        };
        let was_registered = session.state() == SessionState::ConnectedRegistered;
        let identity = session.identity().map(str::to_owned);
        session.handle(msg);

        assert!(session.state().is_connected());
        if was_registered {
            assert_eq!(session.state(), SessionState::ConnectedRegistered);
            assert_eq!(session.identity().map(str::to_owned), identity);
        }
    }
});
