//! Request identity.
//!
//! A `RequestId` is the only piece of distributed state used to correlate a
//! request across processes: it embeds the agent host and the address of the
//! gateway instance holding the pending correlator, serialized as
//! `<requestID>@<agentHost>@<gatewayAddress>`.

use std::fmt;
use std::str::FromStr;

use crate::error::TunnelError;

/// Header carrying the serialized [`RequestId`] on the pull-back path.
pub const HTTP_KUBE_AGENT_REQUEST_ID: &str = "X-Kube-Agent-Request-ID";

/// Identifies which gateway instance owns a tunnel and which logical cluster
/// it serves. Immutable once the tunnel is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelMeta {
    pub gateway_address: String,
    pub agent_host: String,
}

impl TunnelMeta {
    pub fn request_id(&self, id: u64) -> RequestId {
        RequestId {
            meta: self.clone(),
            request_id: id,
        }
    }
}

/// Self-describing identifier of one in-flight request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId {
    pub meta: TunnelMeta,
    pub request_id: u64,
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}@{}",
            self.request_id, self.meta.agent_host, self.meta.gateway_address
        )
    }
}

impl FromStr for RequestId {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('@').collect();
        if parts.len() != 3 {
            return Err(TunnelError::InvalidRequestId(s.to_string()));
        }

        let request_id: u64 = parts[0].parse().unwrap_or(0);
        if request_id == 0 {
            return Err(TunnelError::InvalidRequestId(s.to_string()));
        }

        Ok(RequestId {
            request_id,
            meta: TunnelMeta {
                agent_host: parts[1].to_string(),
                gateway_address: parts[2].to_string(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_round_trip() {
        let cases = [
            (1u64, "local", "10.0.0.1:8080"),
            (u64::MAX, "cluster-a", "gateway-0.gateway:80"),
            (42, "hw-dev", "127.0.0.1:8007"),
        ];

        for (id, host, addr) in cases {
            let rid = TunnelMeta {
                gateway_address: addr.to_string(),
                agent_host: host.to_string(),
            }
            .request_id(id);

            let parsed: RequestId = rid.to_string().parse().unwrap();
            assert_eq!(parsed, rid);
        }
    }

    #[test]
    fn test_zero_id_rejected() {
        let err = "0@a@b".parse::<RequestId>().unwrap_err();
        assert!(matches!(err, TunnelError::InvalidRequestId(_)));
    }

    #[test]
    fn test_two_part_id_rejected() {
        let err = "a@b".parse::<RequestId>().unwrap_err();
        assert!(matches!(err, TunnelError::InvalidRequestId(_)));
    }

    #[test]
    fn test_non_numeric_id_rejected() {
        assert!("x@a@b".parse::<RequestId>().is_err());
    }
}
