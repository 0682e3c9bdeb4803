//! Timing constants shared by the mapper drivers and the discovery engine.

use std::time::Duration;

/// Overall deadline for a single map/refresh/unmap operation.
pub(crate) const MAPPING_DEADLINE: Duration = Duration::from_secs(15);

/// Initial retransmission timeout for NAT-PMP and PCP requests.
///
/// See [RFC 6887 section 8.1.1](https://datatracker.ietf.org/doc/html/rfc6887#section-8.1.1).
pub(crate) const INITIAL_REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

/// Upper bound the retransmission timeout doubles towards.
pub(crate) const MAX_REQUEST_TIMEOUT: Duration = Duration::from_secs(1024);

/// Attempts before a gateway is abandoned.
pub(crate) const MAX_REQUEST_ATTEMPTS: usize = 9;

/// How long `discover` waits for gateways to identify themselves.
pub(crate) const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifetime requested for new mappings, the value recommended by
/// [RFC 6886 section 3.3](https://datatracker.ietf.org/doc/html/rfc6886#section-3.3).
pub(crate) const RECOMMENDED_MAPPING_LIFETIME: u32 = 60 * 60 * 2;

/// `MX` value advertised in SSDP searches. Gateways spread their responses
/// over this many seconds.
pub(crate) const SSDP_MX: u8 = 3;
