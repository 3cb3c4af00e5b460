use std::fmt;
use std::net::SocketAddr;

/// Destination of outgoing traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Target {
    /// Where RTP goes
    pub data: SocketAddr,
    /// Where RTCP goes, if anywhere
    pub control: Option<SocketAddr>,
}

impl Target {
    pub fn new(data: SocketAddr, control: SocketAddr) -> Self {
        Self {
            data,
            control: Some(control),
        }
    }

    pub fn data_only(data: SocketAddr) -> Self {
        Self { data, control: None }
    }

    /// Target with RTCP on the port following the RTP port
    pub fn with_adjacent_control(data: SocketAddr) -> Self {
        let mut control = data;
        control.set_port(data.port().wrapping_add(1));
        Self::new(data, control)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.control {
            Some(control) => write!(f, "{}/{}", self.data, control),
            None => write!(f, "{}", self.data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adjacent_control() {
        let target = Target::with_adjacent_control("10.0.0.1:5004".parse().unwrap());
        assert_eq!(target.control, Some("10.0.0.1:5005".parse().unwrap()));
        assert_eq!(target.to_string(), "10.0.0.1:5004/10.0.0.1:5005");
    }
}
