//! XOE bridges device I/O over TCP: serial UARTs and USB endpoints through a
//! framed tunnel, and block storage through a Fixed-Newstyle NBD server. One
//! binary selects its role at startup and can be re-pointed at runtime
//! through the authenticated management interface.

pub mod args;
pub mod cfgmgr;
pub mod config;
pub mod entropy;
pub mod errors;
pub mod fsm;
pub mod logging;
pub mod mgmt;
pub mod nbd;
pub mod net;
pub mod ring;
pub mod serial;
pub mod shutdown;
pub mod tls;
pub mod usb;
