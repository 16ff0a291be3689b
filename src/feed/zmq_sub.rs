use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{error, info, warn};

use crate::config::FeedConfig;
use crate::engine::FeedHandle;
use crate::error::Result;

/// Parse the optional trailing sequence frame: 4-byte LE counter.
fn parse_sequence(frame: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = frame.try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}

/// Number of messages skipped between `prev` and `seq`, if any.
fn sequence_gap(prev: Option<u32>, seq: u32) -> Option<u32> {
    let prev = prev?;
    let expected = prev.wrapping_add(1);
    (seq != expected).then(|| seq.wrapping_sub(expected))
}

/// Start a ZMQ SUB reader on a plain thread (the zmq crate is synchronous).
///
/// Each message is `[topic, json_body]` with an optional third sequence
/// frame. Bodies are pushed into the engine, waiting for shard capacity.
/// The thread exits once `shutdown` is set.
pub fn start_zmq_subscriber(
    config: &FeedConfig,
    feed: FeedHandle,
    shutdown: Arc<AtomicBool>,
) -> Result<std::thread::JoinHandle<()>> {
    let ctx = zmq::Context::new();
    let sock = ctx.socket(zmq::SUB)?;
    sock.connect(&config.zmq_endpoint)?;
    sock.set_subscribe(config.topic.as_bytes())?;
    info!(endpoint = %config.zmq_endpoint, topic = %config.topic, "ZMQ subscriber connected");

    let topic = config.topic.clone().into_bytes();
    let handle = std::thread::spawn(move || {
        // Keep the context alive for the socket's lifetime.
        let _ctx = ctx;
        let mut last_seq: Option<u32> = None;
        let mut received: u64 = 0;

        while !shutdown.load(Ordering::Acquire) {
            let mut items = [sock.as_poll_item(zmq::POLLIN)];
            match zmq::poll(&mut items, 1000) {
                Ok(_) => {}
                Err(e) => {
                    error!("ZMQ poll error: {e}");
                    std::thread::sleep(std::time::Duration::from_secs(1));
                    continue;
                }
            }
            if !items[0].is_readable() {
                continue;
            }

            match sock.recv_multipart(zmq::DONTWAIT) {
                Ok(msg) if msg.len() >= 2 && msg[0] == topic => {
                    if let Some(seq) = msg.get(2).and_then(|f| parse_sequence(f)) {
                        if let Some(missed) = sequence_gap(last_seq, seq) {
                            warn!(
                                "ZMQ sequence gap detected: expected {}, got {seq} (missed {missed} messages)",
                                last_seq.map_or(0, |p| p.wrapping_add(1))
                            );
                        }
                        last_seq = Some(seq);
                    }
                    feed.push_bytes_blocking(&msg[1]);
                    received += 1;
                    if received % 10_000 == 0 {
                        info!("ZMQ subscriber received {received} messages");
                    }
                }
                Ok(msg) => {
                    warn!("Unexpected ZMQ message format, parts: {}", msg.len());
                }
                Err(e) => {
                    if e != zmq::Error::EAGAIN {
                        error!("ZMQ recv error: {e}");
                    }
                }
            }
        }
        info!("ZMQ subscriber stopped after {received} messages");
    });
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_frame_is_little_endian() {
        assert_eq!(parse_sequence(&[1, 0, 0, 0]), Some(1));
        assert_eq!(parse_sequence(&[0, 1, 0, 0]), Some(256));
        assert_eq!(parse_sequence(&[1, 2, 3]), None);
    }

    #[test]
    fn gap_detection() {
        assert_eq!(sequence_gap(None, 7), None);
        assert_eq!(sequence_gap(Some(7), 8), None);
        assert_eq!(sequence_gap(Some(7), 10), Some(2));
        assert_eq!(sequence_gap(Some(u32::MAX), 0), None);
    }
}
