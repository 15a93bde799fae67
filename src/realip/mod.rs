//! Real-IP extractor: rightmost-untrusted `X-Forwarded-For` parsing.
//!
//! Concatenates the `X-Forwarded-For` header with the transport-level peer
//! address, then scans from the right skipping addresses that fall inside a
//! trusted CIDR range. The first untrusted address wins; if every address is
//! trusted (the default trust list is `0.0.0.0/0` / `::/0`), the transport
//! address is returned. Only `X-Forwarded-For` is honored — `X-Real-IP` is
//! intentionally ignored.

use std::net::IpAddr;

use ipnet::IpNet;

pub fn extract(forwarded_for: Option<&str>, remote_addr: IpAddr, trusted: &[IpNet]) -> IpAddr {
    let mut chain: Vec<IpAddr> = Vec::new();

    if let Some(header) = forwarded_for {
        for part in header.split(',') {
            if let Ok(addr) = part.trim().parse::<IpAddr>() {
                chain.push(addr);
            }
        }
    }
    chain.push(remote_addr);

    for addr in chain.iter().rev() {
        if !crate::config::is_trusted(trusted, *addr) {
            return *addr;
        }
    }

    remote_addr
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    #[test]
    fn empty_header_returns_remote_addr() {
        let remote: IpAddr = "203.0.113.9".parse().unwrap();
        assert_eq!(extract(None, remote, &[]), remote);
    }

    #[test]
    fn skips_trusted_proxies_from_the_right() {
        let trusted = vec![net("10.0.0.0/8")];
        let remote: IpAddr = "10.0.0.1".parse().unwrap();
        let result = extract(Some("203.0.113.9, 10.0.0.2"), remote, &trusted);
        assert_eq!(result, "203.0.113.9".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn all_trusted_falls_back_to_remote_addr() {
        let trusted = vec![net("0.0.0.0/0"), net("::/0")];
        let remote: IpAddr = "203.0.113.9".parse().unwrap();
        let result = extract(Some("198.51.100.1, 198.51.100.2"), remote, &trusted);
        assert_eq!(result, remote);
    }

    #[test]
    fn is_idempotent_for_identical_input() {
        let trusted = vec![net("10.0.0.0/8")];
        let remote: IpAddr = "10.0.0.1".parse().unwrap();
        let a = extract(Some("203.0.113.9, 10.0.0.2"), remote, &trusted);
        let b = extract(Some("203.0.113.9, 10.0.0.2"), remote, &trusted);
        assert_eq!(a, b);
    }

    #[test]
    fn ignores_x_real_ip_by_construction() {
        // The function signature never accepts an X-Real-IP value — this
        // test documents that only X-Forwarded-For participates.
        let remote: IpAddr = "203.0.113.9".parse().unwrap();
        assert_eq!(extract(Some(""), remote, &[]), remote);
    }
}
