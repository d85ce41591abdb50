//! Discard server: reads and forgets (RFC 863).

use evio::{EventLoop, TcpServer};

fn main() -> std::io::Result<()> {
    env_logger::init();

    let event_loop = EventLoop::new()?;
    let server = TcpServer::new(&event_loop, "0.0.0.0:2009".parse().unwrap(), "discard", false)?;
    server.set_message_callback(|conn, buf, when| {
        let data = buf.retrieve_all_as_bytes();
        log::info!("{} discards {} bytes at {}", conn.name(), data.len(), when);
    });
    server.start();
    event_loop.run();
    Ok(())
}
