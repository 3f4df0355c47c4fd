//! Simulated Call Engine: produces plausible descriptions and candidates
//! without any media stack. Used by the node binary and by tests.

use std::net::IpAddr;
use std::sync::Arc;

use crate::engine::{CallEngine, CallEngineFactory, EngineError, EngineEvent, Role, SdpType};
use crate::protocol::IceCandidate;
use crate::room::RoomConnectionParameters;

/// Where a simulated engine delivers its events.
pub type EventEmitter = Arc<dyn Fn(EngineEvent) + Send + Sync>;

pub struct SimulatedEngineFactory {
    local_ip: IpAddr,
    emitter: EventEmitter,
    sessions: u64,
}

impl SimulatedEngineFactory {
    pub fn new(local_ip: IpAddr, emitter: EventEmitter) -> Self {
        Self {
            local_ip,
            emitter,
            sessions: 0,
        }
    }
}

impl CallEngineFactory for SimulatedEngineFactory {
    type Engine = SimulatedEngine;

    fn create(
        &mut self,
        _params: &RoomConnectionParameters,
        role: Role,
    ) -> Result<SimulatedEngine, EngineError> {
        self.sessions += 1;
        Ok(SimulatedEngine {
            local_ip: self.local_ip,
            emitter: self.emitter.clone(),
            session_id: self.sessions,
            role,
            remote_offer: false,
            remote_candidates: Vec::new(),
            closed: false,
        })
    }
}

/// Reports `Connected` once both descriptions are in place.
pub struct SimulatedEngine {
    local_ip: IpAddr,
    emitter: EventEmitter,
    session_id: u64,
    role: Role,
    remote_offer: bool,
    remote_candidates: Vec<IceCandidate>,
    closed: bool,
}

impl SimulatedEngine {
    pub fn role(&self) -> Role {
        self.role
    }

    pub fn remote_candidates(&self) -> &[IceCandidate] {
        &self.remote_candidates
    }

    fn emit(&self, event: EngineEvent) {
        if !self.closed {
            (self.emitter)(event);
        }
    }

    fn description(&self, kind: &str) -> String {
        let family = if self.local_ip.is_ipv6() { "IP6" } else { "IP4" };
        format!(
            "v=0\r\no=duet {} 2 IN {family} {}\r\ns=-\r\nt=0 0\r\na=type:{kind}\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=mid:0\r\n",
            self.session_id, self.local_ip
        )
    }

    fn host_candidate(&self) -> IceCandidate {
        IceCandidate::new(
            "0",
            0,
            format!(
                "candidate:{} 1 udp 2122260223 {} {} typ host",
                self.session_id,
                self.local_ip,
                50_000 + (self.session_id % 1000) as u16
            ),
        )
    }

    fn check_open(&self) -> Result<(), EngineError> {
        if self.closed {
            return Err(EngineError::new("engine closed"));
        }
        Ok(())
    }
}

impl CallEngine for SimulatedEngine {
    fn create_offer(&mut self) -> Result<(), EngineError> {
        self.check_open()?;
        self.emit(EngineEvent::LocalDescription(self.description("offer")));
        self.emit(EngineEvent::IceCandidate(self.host_candidate()));
        Ok(())
    }

    fn create_answer(&mut self) -> Result<(), EngineError> {
        self.check_open()?;
        if !self.remote_offer {
            return Err(EngineError::new("create_answer without remote offer"));
        }
        self.emit(EngineEvent::LocalDescription(self.description("answer")));
        self.emit(EngineEvent::IceCandidate(self.host_candidate()));
        self.emit(EngineEvent::Connected);
        Ok(())
    }

    fn set_remote_description(&mut self, sdp_type: SdpType, sdp: &str) -> Result<(), EngineError> {
        self.check_open()?;
        if !sdp.starts_with("v=0") {
            return Err(EngineError::new("remote description is not SDP"));
        }
        match sdp_type {
            SdpType::Offer => self.remote_offer = true,
            SdpType::Answer => self.emit(EngineEvent::Connected),
        }
        Ok(())
    }

    fn add_remote_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<(), EngineError> {
        self.check_open()?;
        self.remote_candidates.push(candidate.clone());
        Ok(())
    }

    fn remove_remote_ice_candidates(&mut self, candidates: &[IceCandidate]) -> Result<(), EngineError> {
        self.check_open()?;
        self.remote_candidates.retain(|c| !candidates.contains(c));
        Ok(())
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::Mutex;

    fn factory() -> (SimulatedEngineFactory, Arc<Mutex<Vec<EngineEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let emitter: EventEmitter = Arc::new(move |ev| sink.lock().unwrap().push(ev));
        (
            SimulatedEngineFactory::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)), emitter),
            events,
        )
    }

    #[test]
    fn responder_connects_after_answer() {
        let (mut f, events) = factory();
        let mut engine = f
            .create(&RoomConnectionParameters::listening("r1"), Role::Responder)
            .unwrap();
        assert!(engine.create_answer().is_err());
        engine.set_remote_description(SdpType::Offer, "v=0\r\n").unwrap();
        engine.create_answer().unwrap();
        let events = events.lock().unwrap();
        assert!(matches!(&events[0], EngineEvent::LocalDescription(sdp) if sdp.contains("192.168.1.20")));
        assert!(matches!(events[1], EngineEvent::IceCandidate(_)));
        assert_eq!(events[2], EngineEvent::Connected);
    }

    #[test]
    fn closed_engine_is_silent() {
        let (mut f, events) = factory();
        let mut engine = f
            .create(&RoomConnectionParameters::listening("r1"), Role::Initiator)
            .unwrap();
        engine.close();
        assert!(engine.create_offer().is_err());
        assert!(events.lock().unwrap().is_empty());
    }

    #[test]
    fn candidate_removal_is_exact() {
        let (mut f, _events) = factory();
        let mut engine = f
            .create(&RoomConnectionParameters::listening("r1"), Role::Responder)
            .unwrap();
        let a = IceCandidate::new("0", 0, "candidate:a");
        let b = IceCandidate::new("0", 0, "candidate:b");
        engine.add_remote_ice_candidate(&a).unwrap();
        engine.add_remote_ice_candidate(&b).unwrap();
        engine.remove_remote_ice_candidates(&[IceCandidate::new("1", 0, "candidate:a")]).unwrap();
        assert_eq!(engine.remote_candidates().len(), 2);
        engine.remove_remote_ice_candidates(&[a]).unwrap();
        assert_eq!(engine.remote_candidates(), &[b]);
    }
}
