#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

pub use fedemu_broker::*;
pub use fedemu_net as net;
pub use fedemu_wire as wire;
pub use fedemu_wireless as wireless;
