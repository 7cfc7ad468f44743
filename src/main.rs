use std::net::Ipv4Addr;
use std::str::FromStr;
use std::thread;
use std::time::Duration;

use log::{error, info};

use tapstack::NetStack;

const IFNAME: &str = "tap0";
const STACK_ADDR: &str = "10.0.0.4";
const HOST_ADDR: &str = "10.0.0.1";
const NETMASK: &str = "255.255.255.0";
const PORT: u16 = 5501;

fn main() {
    env_logger::init();

    let stack = NetStack::new(
        IFNAME,
        Ipv4Addr::from_str(HOST_ADDR).unwrap(),
        Ipv4Addr::from_str(STACK_ADDR).unwrap(),
        Ipv4Addr::from_str(NETMASK).unwrap(),
    )
    .unwrap();

    if std::env::args().any(|arg| arg == "client") {
        client_loop(&stack);
    } else {
        server_loop(&stack);
    }
}

/// Echoes every read back to the peer until end of stream, forever.
fn server_loop(stack: &NetStack) {
    let mut listener = stack.socket();
    listener.listen(STACK_ADDR, PORT, 8).unwrap();
    info!("echo server on {}:{}", STACK_ADDR, PORT);

    loop {
        let mut peer = match listener.accept() {
            Ok(peer) => peer,
            Err(e) => {
                error!("accept failed: {}", e);
                continue;
            }
        };
        info!("peer connected");

        let mut buf = [0u8; 1500];
        loop {
            match peer.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    info!("echoing {} bytes", n);
                    if let Err(e) = peer.write(&buf[..n]) {
                        error!("write failed: {}", e);
                        break;
                    }
                }
                Err(e) => {
                    error!("read failed: {}", e);
                    break;
                }
            }
        }

        if let Err(e) = peer.close() {
            error!("close failed: {}", e);
        }
        info!("peer gone");
    }
}

/// Pings the host's echo service once a second.
fn client_loop(stack: &NetStack) {
    loop {
        let mut socket = stack.socket();
        if let Err(e) = socket.connect(HOST_ADDR, PORT) {
            error!("connect failed: {}", e);
            thread::sleep(Duration::from_secs(1));
            continue;
        }
        info!("connected to {}:{}", HOST_ADDR, PORT);

        let mut buf = [0u8; 1500];
        loop {
            if let Err(e) = socket.write(b"Ping!") {
                error!("write failed: {}", e);
                break;
            }
            match socket.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => info!("got back: {:?}", String::from_utf8_lossy(&buf[..n])),
                Err(e) => {
                    error!("read failed: {}", e);
                    break;
                }
            }
            thread::sleep(Duration::from_secs(1));
        }

        let _ = socket.close();
    }
}
