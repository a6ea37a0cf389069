//! Local port probing for listener groups

use std::net::TcpListener;
use std::ops::RangeInclusive;

use rand::Rng;

use crate::error::ChannelError;

/// Bind a listener on a random free port within `range`
///
/// Tries at most `attempts` random candidates and keeps the first listener
/// that binds, so the port cannot be taken between probing and use. The
/// returned listener is already non-blocking and ready for
/// `tokio::net::TcpListener::from_std`.
pub fn bind_in_range(
    host: &str,
    range: RangeInclusive<u16>,
    attempts: u32,
) -> Result<(TcpListener, u16), ChannelError> {
    let mut rng = rand::thread_rng();

    for _ in 0..attempts {
        let candidate = rng.gen_range(range.clone());
        let address = format!("{}:{}", host, candidate);

        match TcpListener::bind(&address) {
            Ok(listener) => {
                listener
                    .set_nonblocking(true)
                    .map_err(|source| ChannelError::Bind { address, source })?;
                tracing::debug!("Bound local port {}", candidate);
                return Ok((listener, candidate));
            }
            Err(e) => {
                tracing::trace!("Port {} unavailable: {}", candidate, e);
            }
        }
    }

    Err(ChannelError::NoFreePort { attempts, range })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binds_within_range() {
        let (listener, port) = bind_in_range("127.0.0.1", 20000..=60000, 64).unwrap();
        assert!((20000..=60000).contains(&port));
        assert_eq!(listener.local_addr().unwrap().port(), port);
    }

    #[test]
    fn test_gives_up_after_bounded_attempts() {
        let taken = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let err = bind_in_range("127.0.0.1", port..=port, 3).unwrap_err();
        assert!(matches!(err, ChannelError::NoFreePort { attempts: 3, .. }));
        assert!(err.is_capacity());
    }
}
