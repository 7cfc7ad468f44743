use std::net::Ipv4Addr;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Tap error: {0}")]
    Tap(#[from] tidy_tuntap::error::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Syscall error: {0}")]
    Errno(#[from] nix::errno::Errno),

    #[error("Bad address: {0}")]
    AddrParse(#[from] std::net::AddrParseError),

    #[error("Malformed packet: {0}")]
    Parse(#[from] etherparse::ReadError),

    #[error("Truncated packet")]
    Truncated,

    #[error("Bad TCP checksum")]
    BadChecksum,

    #[error("No route to host {0}")]
    HostUnreachable(Ipv4Addr),

    #[error("Socket is not connected")]
    NotConnected,

    #[error("Socket is not listening")]
    NotListening,

    #[error("Connection is closing")]
    Closing,

    #[error("Connection refused")]
    ConnectionRefused,

    #[error("Connection already exists")]
    ConnectionReuse,

    #[error("Connection is closed")]
    ConnectionClosed,

    #[error("Socket already in use")]
    SocketInUse,

    #[error("Operation would block")]
    WouldBlock,

    #[error("Accept failed")]
    AcceptFailed,

    #[error("No data available")]
    NoData,

    #[error("Reassembly buffer lost contiguity")]
    NonContiguousData,
}
