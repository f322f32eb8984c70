use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the UNIX epoch, the clock all wire timestamps and
/// retransmission bookkeeping are expressed in.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the UNIX epoch")
        .as_millis() as u64
}
