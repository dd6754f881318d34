#![no_main]

use faceshot_client::protocol::ClientMessage;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = serde_json::from_slice::<ClientMessage>(data);

    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(ClientMessage::Register { embedding, .. } | ClientMessage::Shoot { embedding }) =
            serde_json::from_str::<ClientMessage>(s)
        {
            let _ = embedding.is_well_formed();
        }
    }
});
