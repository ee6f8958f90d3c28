use std::net::SocketAddr;
use std::sync::Arc;
use structopt::StructOpt;
use teonet::{transport::UdpTransport, Config, EventKind, Handler, Result, Teonet};

#[derive(StructOpt, Debug)]
#[structopt(name = "teonet")]
enum Opt {
    Client(ClientOpt),
    Server(ServerOpt),
}

#[derive(StructOpt, Debug)]
struct ClientOpt {
    /// Rendezvous server, may be repeated.
    #[structopt(long = "auth", required = true)]
    auth: Vec<String>,

    #[structopt(long = "listen-addr", default_value = "0.0.0.0:0")]
    listen_addr: SocketAddr,

    /// Peer address to connect to; without it the client only listens.
    #[structopt(long = "peer")]
    peer: Option<String>,

    #[structopt(long = "message", default_value = "hello")]
    message: String,
}

#[derive(StructOpt, Debug)]
struct ServerOpt {
    #[structopt(long = "listen-addr", default_value = "0.0.0.0:7050")]
    listen_addr: SocketAddr,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let opt: Opt = StructOpt::from_args();

    let node = match opt {
        Opt::Server(opt) => run_server(opt)?,
        Opt::Client(opt) => run_client(opt).await?,
    };

    tokio::signal::ctrl_c().await?;
    node.close();
    Ok(())
}

fn run_server(opt: ServerOpt) -> Result<Teonet> {
    let config = Config {
        rendezvous_server: true,
        ..Default::default()
    };
    let node = Teonet::new(config, UdpTransport::bind(opt.listen_addr)?, vec![])?;
    log::info!("rendezvous server {} listening on {}", node.address(), opt.listen_addr);
    Ok(node)
}

fn printer() -> Handler {
    Arc::new(|channel, packet, event| {
        match event.kind {
            EventKind::Data => println!(
                "{}: {}",
                packet.from_addr(),
                String::from_utf8_lossy(packet.data())
            ),
            kind => log::info!("{:?} {}", kind, channel.address()),
        }
        true
    })
}

async fn run_client(opt: ClientOpt) -> Result<Teonet> {
    let config = Config {
        auth_servers: opt.auth,
        ..Default::default()
    };
    let node = Teonet::new(config, UdpTransport::bind(opt.listen_addr)?, vec![printer()])?;
    node.connect::<&str>(&[]).await?;
    println!("address {}", node.address());

    if let Some(peer) = opt.peer {
        node.connect_to(&peer, vec![]).await?;
        node.send_to(&peer, opt.message.as_bytes())?;
    }

    Ok(node)
}
