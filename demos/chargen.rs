//! Chargen server (RFC 864): an endless printable-pattern stream, paced by
//! the write-complete callback so output never outruns the peer.

use std::sync::Arc;

use evio::{EventLoop, TcpConnection, TcpServer};

fn pattern_line() -> Vec<u8> {
    // The classic 72-column rotating pattern, one line per call.
    let mut line = Vec::with_capacity(127 * 73);
    let printable: Vec<u8> = (33u8..=126).collect();
    for shift in 0..printable.len() {
        for i in 0..72 {
            line.push(printable[(shift + i) % printable.len()]);
        }
        line.push(b'\n');
    }
    line
}

fn refill(conn: &Arc<TcpConnection>, chunk: &[u8]) {
    conn.send(chunk);
}

fn main() -> std::io::Result<()> {
    env_logger::init();

    let chunk: Arc<Vec<u8>> = Arc::new(pattern_line());

    let event_loop = EventLoop::new()?;
    let server = TcpServer::new(&event_loop, "0.0.0.0:2019".parse().unwrap(), "chargen", false)?;
    {
        let chunk = chunk.clone();
        server.set_connection_callback(move |conn| {
            if conn.connected() {
                conn.set_tcp_no_delay(true).ok();
                refill(conn, &chunk);
            }
        });
    }
    {
        // Keep exactly one chunk in flight: top up when the last one left.
        let chunk = chunk.clone();
        server.set_write_complete_callback(move |conn| refill(conn, &chunk));
    }
    server.start();
    event_loop.run();
    Ok(())
}
