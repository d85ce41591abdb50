//! Daytime server (RFC 867): write the time, then half-close.

use evio::{EventLoop, TcpServer};

fn main() -> std::io::Result<()> {
    env_logger::init();

    let event_loop = EventLoop::new()?;
    let server = TcpServer::new(&event_loop, "0.0.0.0:2013".parse().unwrap(), "daytime", false)?;
    server.set_connection_callback(|conn| {
        if conn.connected() {
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default();
            conn.send(format!("{}\n", now.as_secs()).as_bytes());
            conn.shutdown();
        }
    });
    server.start();
    event_loop.run();
    Ok(())
}
