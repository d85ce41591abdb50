//! Echo server: every byte received goes straight back.

use evio::{EventLoop, TcpServer};

fn main() -> std::io::Result<()> {
    env_logger::init();

    let event_loop = EventLoop::new()?;
    let server = TcpServer::new(&event_loop, "0.0.0.0:2007".parse().unwrap(), "echo", false)?;
    server.set_connection_callback(|conn| {
        log::info!(
            "{} -> {} is {}",
            conn.peer_addr(),
            conn.local_addr(),
            if conn.connected() { "up" } else { "down" }
        );
    });
    server.set_message_callback(|conn, buf, when| {
        let data = buf.retrieve_all_as_bytes();
        log::info!("{} echoed {} bytes at {}", conn.name(), data.len(), when);
        conn.send(&data);
    });
    server.start();
    event_loop.run();
    Ok(())
}
