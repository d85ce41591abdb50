//! Chat server: length-prefixed messages broadcast to every client.
//!
//! Frames are a 32-bit big-endian length followed by that many payload
//! bytes. Lengths outside [0, 65536] are a protocol violation and get the
//! sender disconnected.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use evio::{Buffer, EventLoop, TcpConnection, TcpServer, Timestamp};

const HEADER_LEN: usize = 4;
const MAX_MESSAGE_LEN: u32 = 65536;

/// Splits the byte stream into length-prefixed frames and re-frames
/// outgoing messages.
struct LengthHeaderCodec<F: Fn(&Arc<TcpConnection>, Vec<u8>, Timestamp)> {
    on_message: F,
}

impl<F: Fn(&Arc<TcpConnection>, Vec<u8>, Timestamp)> LengthHeaderCodec<F> {
    fn new(on_message: F) -> LengthHeaderCodec<F> {
        LengthHeaderCodec { on_message }
    }

    fn on_data(&self, conn: &Arc<TcpConnection>, buf: &mut Buffer, when: Timestamp) {
        while buf.readable_bytes() >= HEADER_LEN {
            let len = buf.peek_u32();
            if len > MAX_MESSAGE_LEN {
                log::error!("invalid length {}", len);
                conn.shutdown();
                break;
            } else if buf.readable_bytes() >= HEADER_LEN + len as usize {
                buf.retrieve(HEADER_LEN);
                let message = buf.retrieve_as_bytes(len as usize);
                (self.on_message)(conn, message, when);
            } else {
                break;
            }
        }
    }

}

/// Frames `message` with its length header and queues it on `conn`.
fn send_message(conn: &Arc<TcpConnection>, message: &[u8]) {
    let mut buf = Buffer::new();
    buf.append(message);
    buf.prepend(&(message.len() as u32).to_be_bytes());
    conn.send_buffer(&mut buf);
}

fn main() -> std::io::Result<()> {
    env_logger::init();

    let members: Arc<Mutex<HashMap<String, Arc<TcpConnection>>>> =
        Arc::new(Mutex::new(HashMap::new()));

    let event_loop = EventLoop::new()?;
    let server = TcpServer::new(&event_loop, "0.0.0.0:2037".parse().unwrap(), "chat", false)?;

    {
        let members = members.clone();
        server.set_connection_callback(move |conn| {
            let mut members = members.lock().unwrap();
            if conn.connected() {
                members.insert(conn.name().to_string(), conn.clone());
            } else {
                members.remove(conn.name());
            }
        });
    }
    {
        let members = members.clone();
        let codec = LengthHeaderCodec::new(
            move |_conn: &Arc<TcpConnection>, message: Vec<u8>, _when| {
                for member in members.lock().unwrap().values() {
                    send_message(member, &message);
                }
            },
        );
        server.set_message_callback(move |conn, buf, when| codec.on_data(conn, buf, when));
    }

    server.start();
    event_loop.run();
    Ok(())
}
