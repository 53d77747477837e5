//! Files consumed by out-of-band session scripts.

use std::{
    fmt, fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use fedemu_wire::{NodeId, NodeType};

use crate::server::Server;

/// Human readable description of a node, as recorded next to its server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct NodeDescriptor {
    pub(crate) id: NodeId,
    pub(crate) name: String,
    pub(crate) node_type: NodeType,
}

impl fmt::Display for NodeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {:?}", self.id, self.name, self.node_type)
    }
}

fn server_line(server: &Server) -> String {
    let host = server.host.as_deref().unwrap_or("None");
    let port = server.port.map_or_else(|| "None".to_owned(), |p| p.to_string());
    format!("{} {host} {port}", server.name)
}

/// Writes `<session_dir>/servers`: the master session id, then one line per remote
/// server with its address and the local end of its connection.
pub(crate) fn write_servers(session_dir: &Path, master: u32, servers: &[Server]) -> io::Result<PathBuf> {
    let path = session_dir.join("servers");
    let mut file = fs::File::create(&path)?;

    writeln!(file, "master={master}")?;
    for server in servers.iter().filter(|s| !s.is_local()) {
        let (lhost, lport) = match &server.connection {
            Some(conn) => {
                let local = conn.local_address();
                (local.ip().to_string(), local.port().to_string())
            }
            None => ("None".to_owned(), "None".to_owned()),
        };
        writeln!(file, "{} {lhost} {lport}", server_line(server))?;
    }

    Ok(path)
}

/// Writes `<session_dir>/<node name>.conf/server`, recording which server runs the node.
pub(crate) fn write_node_server(
    session_dir: &Path,
    node: &NodeDescriptor,
    server: &Server,
) -> io::Result<PathBuf> {
    let dir = session_dir.join(format!("{}.conf", node.name));
    fs::create_dir_all(&dir)?;

    let path = dir.join("server");
    fs::write(&path, format!("{}\n{node}\n", server_line(server)))?;
    Ok(path)
}
