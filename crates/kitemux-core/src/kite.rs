//! Kites: published (protocol, domain, port) routes mapped to local backends.
//!
//! The table has a hard capacity fixed at construction. A slot whose
//! protocol is empty is free.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One published service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Kite {
    pub protocol: String,
    pub public_domain: String,
    /// Public port, or 0 to match any port.
    #[serde(default)]
    pub public_port: u16,
    pub secret: String,
    pub local_domain: String,
    pub local_port: u16,
}

impl Kite {
    pub fn is_free(&self) -> bool {
        self.protocol.is_empty()
    }

    /// Parse `proto:domain:port:secret:local_host:local_port`.
    ///
    /// `port` may be `0` or empty for a port-agnostic kite.
    pub fn parse_spec(spec: &str) -> Result<Self> {
        let parts: Vec<&str> = spec.split(':').collect();
        let [protocol, domain, port, secret, local_domain, local_port] = parts[..] else {
            return Err(Error::InvalidKite(format!(
                "expected proto:domain:port:secret:local_host:local_port, got {spec:?}"
            )));
        };
        let public_port = if port.is_empty() {
            0
        } else {
            port.parse()
                .map_err(|_| Error::InvalidKite(format!("bad public port {port:?}")))?
        };
        let local_port = local_port
            .parse()
            .map_err(|_| Error::InvalidKite(format!("bad local port {local_port:?}")))?;
        if protocol.is_empty() || domain.is_empty() {
            return Err(Error::InvalidKite(format!("empty protocol or domain in {spec:?}")));
        }
        Ok(Self {
            protocol: protocol.to_string(),
            public_domain: domain.to_string(),
            public_port,
            secret: secret.to_string(),
            local_domain: local_domain.to_string(),
            local_port,
        })
    }
}

/// Fixed-capacity kite table addressed by stable slot index.
#[derive(Debug, Clone)]
pub struct KiteTable {
    slots: Vec<Kite>,
}

impl KiteTable {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: vec![Kite::default(); capacity],
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Claim the first free slot for a new kite.
    ///
    /// A zero public port combined with a protocol like `http-8080` splits
    /// the port out of the protocol name.
    pub fn add_kite(
        &mut self,
        protocol: &str,
        public_domain: &str,
        public_port: u16,
        secret: &str,
        local_domain: &str,
        local_port: u16,
    ) -> Result<usize> {
        let capacity = self.capacity();
        let (index, slot) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, k)| k.is_free())
            .ok_or(Error::NoMoreKites(capacity))?;

        let (protocol, public_port) = match protocol.split_once('-') {
            Some((proto, port)) if public_port == 0 => (proto, port.parse().unwrap_or(0)),
            _ => (protocol, public_port),
        };
        if protocol.is_empty() {
            return Err(Error::InvalidKite("empty protocol".into()));
        }

        *slot = Kite {
            protocol: protocol.to_string(),
            public_domain: public_domain.to_string(),
            public_port,
            secret: secret.to_string(),
            local_domain: local_domain.to_string(),
            local_port,
        };
        Ok(index)
    }

    /// Add a fully-formed kite.
    pub fn insert(&mut self, kite: &Kite) -> Result<usize> {
        self.add_kite(
            &kite.protocol,
            &kite.public_domain,
            kite.public_port,
            &kite.secret,
            &kite.local_domain,
            kite.local_port,
        )
    }

    /// Free a slot. Returns the kite that was there.
    pub fn remove_kite(&mut self, index: usize) -> Option<Kite> {
        let slot = self.slots.get_mut(index)?;
        if slot.is_free() {
            return None;
        }
        Some(std::mem::take(slot))
    }

    /// Look up a kite by protocol, domain and port.
    ///
    /// An exact port match wins; a kite registered without a port is
    /// returned as the fallback.
    pub fn find_kite(&self, protocol: &str, domain: &str, port: u16) -> Option<usize> {
        let mut fallback = None;
        for (index, kite) in self.iter() {
            if kite.public_domain.eq_ignore_ascii_case(domain)
                && kite.protocol.eq_ignore_ascii_case(protocol)
            {
                if kite.public_port == 0 {
                    fallback = Some(index);
                } else if kite.public_port == port {
                    return Some(index);
                }
            }
        }
        fallback
    }

    pub fn get(&self, index: usize) -> Option<&Kite> {
        self.slots.get(index).filter(|k| !k.is_free())
    }

    /// Occupied slots with their indices.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Kite)> {
        self.slots.iter().enumerate().filter(|(_, k)| !k.is_free())
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn add_until_full() {
        let mut kites = KiteTable::with_capacity(2);
        assert_eq!(
            kites.add_kite("http", "foo", 80, "sec", "localhost", 80).unwrap(),
            0
        );
        assert_eq!(
            kites.add_kite("http", "foo", 80, "sec", "localhost", 80).unwrap(),
            1
        );
        let err = kites
            .add_kite("http", "foo", 80, "sec", "localhost", 80)
            .unwrap_err();
        assert!(matches!(err, Error::NoMoreKites(2)));
    }

    #[test]
    fn find_prefers_exact_port_over_fallback() {
        let mut kites = KiteTable::with_capacity(4);
        let any = kites
            .add_kite("http", "x.example.com", 0, "s", "localhost", 8080)
            .unwrap();
        let exact = kites
            .add_kite("http", "x.example.com", 8443, "s", "localhost", 9000)
            .unwrap();

        assert_eq!(kites.find_kite("http", "x.example.com", 8443), Some(exact));
        assert_eq!(kites.find_kite("http", "x.example.com", 80), Some(any));
        assert_eq!(kites.find_kite("HTTP", "X.Example.COM", 80), Some(any));
        assert_eq!(kites.find_kite("https", "x.example.com", 80), None);
        assert_eq!(kites.find_kite("http", "bar", 80), None);
    }

    #[test]
    fn port_split_from_protocol() {
        let mut kites = KiteTable::with_capacity(4);
        let idx = kites
            .add_kite("http-8080", "x.example.com", 0, "s", "localhost", 80)
            .unwrap();
        let kite = kites.get(idx).unwrap();
        assert_eq!(kite.protocol, "http");
        assert_eq!(kite.public_port, 8080);
    }

    #[test]
    fn removed_slot_is_reused() {
        let mut kites = KiteTable::with_capacity(1);
        let idx = kites.add_kite("http", "a", 80, "s", "localhost", 80).unwrap();
        assert!(kites.remove_kite(idx).is_some());
        assert!(kites.is_empty());
        assert!(kites.remove_kite(idx).is_none());
        assert_eq!(kites.add_kite("http", "b", 80, "s", "localhost", 80).unwrap(), idx);
        assert_eq!(kites.find_kite("http", "a", 80), None);
    }

    #[test]
    fn parse_spec_fields() {
        let kite = Kite::parse_spec("http:x.example.com::secret:localhost:8080").unwrap();
        assert_eq!(kite.protocol, "http");
        assert_eq!(kite.public_domain, "x.example.com");
        assert_eq!(kite.public_port, 0);
        assert_eq!(kite.local_port, 8080);

        assert!(Kite::parse_spec("http:x.example.com").is_err());
        assert!(Kite::parse_spec("http:x:80:s:localhost:notaport").is_err());
    }
}
