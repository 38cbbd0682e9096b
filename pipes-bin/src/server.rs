#![deny(unsafe_code)]

use structopt::StructOpt;

use pipes::conf::{Options, Settings};
use pipes::logger::logger_init;
use pipes::server::{self, ServerContext};
use pipes::{Context, Result};

#[tokio::main]
async fn main() -> Result<()> {
    //init config
    let settings = Settings::init(Options::from_args())?;

    //init log
    logger_init(&settings.log)?;
    Settings::logs();

    let scx = ServerContext::new(settings.clone());
    let (laddr, server) = server::bind(scx.clone(), settings.server.laddr)?;

    //ctrl-c fails every open two-way call before the listener goes away
    let signal = scx.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                let ctx = Context::new(signal.tints.next_tint());
                ctx.push("signal:ctrl-c");
                signal.shutdown(&ctx);
            }
            Err(e) => log::error!("ctrl-c handler, {e}"),
        }
    });

    log::info!("pipesd started on {laddr}, tint name: {}", scx.tints.name());
    server.await;
    log::info!("pipesd stopped");
    Ok(())
}
