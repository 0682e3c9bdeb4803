//! Port mapping client for NAT-PMP, PCP and UPnP-IGD.
//!
//! Gateways on home and office networks speak up to three protocols to let
//! an application behind NAT be reached from the public Internet: NAT-PMP
//! ([RFC 6886]), its successor PCP ([RFC 6887]), and UPnP-IGD (SOAP over
//! HTTP, discovered over SSDP). This crate discovers which of those the
//! local gateways speak and presents them behind one mapping interface.
//!
//! All socket traffic flows through a single [`NetworkGateway`] actor; see
//! [`discover`] for the one-shot API and [`Client`] for the long-running
//! service that keeps a mapping alive.
//!
//! ```no_run
//! use portmapper::{discover, NetworkGateway, PortType};
//!
//! # async fn example() -> Result<(), portmapper::Error> {
//! let net = NetworkGateway::spawn();
//! let mappers = discover(&net).await?;
//! for mapper in &mappers {
//!     let port = std::num::NonZeroU16::new(5000).unwrap();
//!     match mapper.map_port(PortType::Udp, port, None, 7200).await {
//!         Ok(mapped) => println!("reachable at {mapped}"),
//!         Err(e) => println!("{mapper} refused: {e}"),
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! [RFC 6886]: https://datatracker.ietf.org/doc/html/rfc6886
//! [RFC 6887]: https://datatracker.ietf.org/doc/html/rfc6887

mod current_mapping;
mod defaults;
mod discovery;
mod error;
mod gateway;
mod mapping;
pub mod nat_pmp;
pub mod pcp;
mod service;
pub mod upnp;
mod util;

pub use discovery::discover;
pub use error::{CodecError, Error, ServerFailure, TransportError};
pub use gateway::{Inbound, NetworkGateway, SocketHandle, MAX_SEND_BUFFER};
pub use mapping::{MappedPort, Mapper, PortType, ProtocolTag};
pub use service::{Client, Config, ProbeOutput, Service};
