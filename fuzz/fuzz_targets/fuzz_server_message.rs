#![no_main]

use faceshot_client::protocol::ServerMessage;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Frames arrive as text; anything that is not UTF-8 never reaches the parser.
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(msg) = serde_json::from_str::<ServerMessage>(s) {
            // Whatever parses must re-encode.
            let _ = serde_json::to_string(&msg).expect("re-encode parsed message");
        }
    }
});
