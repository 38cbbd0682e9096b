use std::net::SocketAddr;

use structopt::StructOpt;

#[derive(StructOpt, Debug, Clone, Default)]
#[structopt(name = "pipesd", about = "HTTP message broker")]
pub struct Options {
    /// Config filename
    #[structopt(name = "config", short = "f", long)]
    pub cfg_name: Option<String>,

    /// Listen address, overrides server.laddr
    #[structopt(name = "laddr", long)]
    pub laddr: Option<SocketAddr>,

    /// Prefix of every tint issued by this instance, overrides pipes.tint_name
    #[structopt(name = "tint-name", long)]
    pub tint_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_options() {
        let opts =
            Options::from_iter(["pipesd", "-f", "/tmp/p.toml", "--laddr", "127.0.0.1:8080", "--tint-name", "edge"]);
        assert_eq!(opts.cfg_name.as_deref(), Some("/tmp/p.toml"));
        assert_eq!(opts.laddr, Some(SocketAddr::from(([127, 0, 0, 1], 8080))));
        assert_eq!(opts.tint_name.as_deref(), Some("edge"));
    }
}
