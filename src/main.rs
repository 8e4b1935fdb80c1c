use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::info;

use faketcp_tunnel::client::{FakeTcpClient, DEFAULT_ECHO_TIMEOUT};
use faketcp_tunnel::config::{
    decode_key, load_config, ClientConfig, ServerConfig, FAKETCP_CLIENT_CONFIG_EXAMPLE,
    FAKETCP_SERVER_CONFIG_EXAMPLE, ICMP_TUNNEL_CONFIG_EXAMPLE,
};
use faketcp_tunnel::server::{FakeTcpServer, MessageHandler};

#[tokio::main]
async fn main() -> io::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        usage(&args[0]);
    }

    match args[1].as_str() {
        "generate-config" => {
            std::fs::write("faketcp_server.json", FAKETCP_SERVER_CONFIG_EXAMPLE)?;
            std::fs::write("faketcp_client.json", FAKETCP_CLIENT_CONFIG_EXAMPLE)?;
            std::fs::write("icmp_tunnel.json", ICMP_TUNNEL_CONFIG_EXAMPLE)?;
            println!("wrote faketcp_server.json, faketcp_client.json, icmp_tunnel.json");
            Ok(())
        }
        "faketcp-server" => run_faketcp_server(config_path(&args)).await,
        "faketcp-client" => run_faketcp_client(config_path(&args)).await,
        "icmp-server" => run_icmp_server(config_path(&args)).await,
        "icmp-client" => run_icmp_client(config_path(&args)).await,
        mode => {
            eprintln!("unknown mode: {}", mode);
            usage(&args[0]);
        }
    }
}

fn usage(prog: &str) -> ! {
    eprintln!(
        "Usage: {} <faketcp-server|faketcp-client|icmp-server|icmp-client|generate-config> [config_file]",
        prog
    );
    std::process::exit(1);
}

fn config_path(args: &[String]) -> &str {
    match args.get(2) {
        Some(path) => path,
        None => usage(&args[0]),
    }
}

fn init_logging(level: &str) {
    env_logger::Builder::new()
        .filter_level(level.parse().unwrap_or(log::LevelFilter::Info))
        .init();
}

fn parse_addr(addr: &str) -> io::Result<SocketAddr> {
    addr.parse().map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid address: {}", addr),
        )
    })
}

async fn run_faketcp_server(path: &str) -> io::Result<()> {
    let cfg: ServerConfig = load_config(path)?;
    init_logging(&cfg.log_level);
    let psk = decode_key(&cfg.psk_base64)?;

    let handler: MessageHandler = Arc::new(|peer, payload: &[u8]| {
        info!(
            "from {} payload(len={}): {}",
            peer,
            payload.len(),
            String::from_utf8_lossy(payload)
        );
    });
    let socket = tokio::net::UdpSocket::bind(&cfg.listen_addr).await?;
    let server = FakeTcpServer::with_socket(
        Arc::new(socket),
        psk,
        Duration::from_secs(cfg.idle_timeout_secs),
        handler,
    );
    info!("fake-tcp server listening {}", cfg.listen_addr);
    server.run().await?;
    Ok(())
}

async fn run_faketcp_client(path: &str) -> io::Result<()> {
    let cfg: ClientConfig = load_config(path)?;
    init_logging(&cfg.log_level);
    let psk = decode_key(&cfg.psk_base64)?;
    let server = parse_addr(&cfg.server_addr)?;

    let mut client = FakeTcpClient::connect(server, &psk).await?;
    client.send(cfg.message.as_bytes()).await?;
    info!("sent payload, waiting for echo...");
    let echo = client.recv_echo(DEFAULT_ECHO_TIMEOUT).await?;
    info!("echo payload: {}", String::from_utf8_lossy(&echo));
    client.close().await?;
    Ok(())
}

#[cfg(target_os = "linux")]
async fn run_icmp_server(path: &str) -> io::Result<()> {
    use faketcp_tunnel::config::TunnelConfig;
    use faketcp_tunnel::socket::RawIcmpSocket;
    use faketcp_tunnel::tunnel::TunnelServer;

    let cfg: TunnelConfig = load_config(path)?;
    init_logging(&cfg.log_level);
    let key = decode_key(&cfg.tunnel_key_base64)?;
    let backend = parse_addr(&cfg.backend_addr)?;

    let socket = Arc::new(RawIcmpSocket::new()?);
    let server = TunnelServer::new(socket, backend, &key)?
        .with_max_fragment_len(cfg.max_fragment_len)
        .with_reassembly_timeout(Duration::from_secs(cfg.reassembly_timeout_secs));
    server.run().await?;
    Ok(())
}

#[cfg(target_os = "linux")]
async fn run_icmp_client(path: &str) -> io::Result<()> {
    use faketcp_tunnel::config::TunnelConfig;
    use faketcp_tunnel::socket::RawIcmpSocket;
    use faketcp_tunnel::tunnel::TunnelClient;

    let cfg: TunnelConfig = load_config(path)?;
    init_logging(&cfg.log_level);
    let key = decode_key(&cfg.tunnel_key_base64)?;
    let server_ip: std::net::IpAddr = cfg.server_ip.parse().map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid server ip: {}", cfg.server_ip),
        )
    })?;

    let socket = Arc::new(RawIcmpSocket::new()?);
    let mut client = TunnelClient::new(socket, &key)?.with_max_fragment_len(cfg.max_fragment_len);
    let reply = client
        .send(SocketAddr::new(server_ip, 0), cfg.message.as_bytes())
        .await?;
    info!("tunnel reply ({} bytes): {}", reply.len(), String::from_utf8_lossy(&reply));
    Ok(())
}

#[cfg(not(target_os = "linux"))]
async fn run_icmp_server(_path: &str) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "icmp modes require linux raw sockets",
    ))
}

#[cfg(not(target_os = "linux"))]
async fn run_icmp_client(_path: &str) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "icmp modes require linux raw sockets",
    ))
}
