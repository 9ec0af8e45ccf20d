//! TCP echo server built on the millrace core.
//!
//! Run with `cargo run --example echo_server`, then connect with
//! `nc 127.0.0.1 8080` and type away.

use log::{error, info};
use millrace::net::{ServerSocket, Socket};
use millrace::EventLoop;

const BUFFER_SIZE: usize = 8192;

fn echo_read(socket: &Socket) {
    socket.read_some(vec![0; BUFFER_SIZE], |socket, result, buf| match result {
        Ok(0) => {
            info!("peer closed the connection");
            socket.close();
        }
        Ok(n) => {
            let mut data = buf;
            data.truncate(n);
            echo_write(socket, data);
        }
        Err(e) => {
            error!("read failed: {}", e);
            socket.close();
        }
    });
}

fn echo_write(socket: &Socket, data: Vec<u8>) {
    socket.write_some(data, |socket, result, mut buf| match result {
        // writable-again notification: nothing was sent, resubmit
        Ok(0) => echo_write(socket, buf),
        Ok(n) if n < buf.len() => {
            buf.drain(..n);
            echo_write(socket, buf);
        }
        Ok(_) => echo_read(socket),
        Err(e) => {
            error!("write failed: {}", e);
            socket.close();
        }
    });
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let event_loop = EventLoop::default();

    let server = ServerSocket::new(&event_loop, Some(Box::new(|| info!("listener closed"))));
    server.init(128)?;
    server.set_reuse_address(true)?;
    server.bind(None, 8080)?;
    server.accept(|_server, result| match result {
        Ok(socket) => {
            if let Err(e) = socket.set_tcp_no_delay(true) {
                error!("failed to set TCP_NODELAY: {}", e);
            }
            echo_read(&socket);
        }
        Err(e) => error!("accept failed: {}", e),
    })?;

    info!("echo server listening on 0.0.0.0:8080");
    event_loop.run()?;

    Ok(())
}
