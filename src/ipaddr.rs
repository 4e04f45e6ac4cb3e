// ipaddr.rs - the IP-Address IPCP option
//
// The canonical option handler: draws a (local, peer) pair from the address
// database on first use, converges with the peer through Ack/Nak, and on the
// transition into Opened programs the kernel point-to-point interface in a
// fixed order. Whatever was leased goes back to the database on teardown.

use std::net::Ipv4Addr;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::iface::{IfaceBackend, NpMode, PppUnit, IFF_POINTOPOINT, IFF_UP, PPP_IP};
use crate::ipcp::{IpcpOption, LinkResources, OptionRegistry, Verdict, CI_ADDR};
use crate::ipdb::IpPool;

/// TLV length of the address option, header included
const OPT_LEN: usize = 6;

pub struct AddrOption {
    /// Address we advertise as ours
    local: Option<Ipv4Addr>,
    /// Address the peer will use
    peer: Option<Ipv4Addr>,
    /// The exact pair obtained from the pool, owed back on close
    leased: Option<(Ipv4Addr, Ipv4Addr)>,
    pool: Arc<dyn IpPool>,
    iface: Arc<dyn IfaceBackend>,
    unit: PppUnit,
    session: Uuid,
    fatal_ioctl: bool,
}

/// Hook the address option into an engine registry
pub fn register(registry: &mut OptionRegistry) {
    registry.register(|res| Box::new(AddrOption::new(res)));
}

impl AddrOption {
    pub fn new(res: &LinkResources) -> Self {
        Self {
            local: None,
            peer: None,
            leased: None,
            pool: res.pool.clone(),
            iface: res.iface.clone(),
            unit: res.unit,
            session: res.session,
            fatal_ioctl: res.fatal_ioctl,
        }
    }

    /// Program the kernel device: addresses before flags, flags before
    /// enabling the protocol. Each failed step is logged; with the fatal
    /// policy the first failure aborts and declines the layer.
    fn program_interface(&self) -> Result<()> {
        let (Some(local), Some(peer)) = (self.local, self.peer) else {
            return Err(Error::Protocol("address negotiation incomplete".into()));
        };
        let device = self.unit.name();

        if let Err(e) = self.iface.set_local_addr(&self.unit, local) {
            tracing::error!(%device, error = %e, "failed to set local address");
            if self.fatal_ioctl {
                return Err(Error::Iface(e));
            }
        }
        if let Err(e) = self.iface.set_dest_addr(&self.unit, peer) {
            tracing::error!(%device, error = %e, "failed to set remote address");
            if self.fatal_ioctl {
                return Err(Error::Iface(e));
            }
        }
        match self.iface.flags(&self.unit) {
            Ok(flags) => {
                if let Err(e) = self.iface.set_flags(&self.unit, flags | IFF_UP | IFF_POINTOPOINT) {
                    tracing::error!(%device, error = %e, "failed to set interface flags");
                    if self.fatal_ioctl {
                        return Err(Error::Iface(e));
                    }
                }
            }
            Err(e) => {
                tracing::error!(%device, error = %e, "failed to get interface flags");
                if self.fatal_ioctl {
                    return Err(Error::Iface(e));
                }
            }
        }
        if let Err(e) = self.iface.set_np_mode(&self.unit, PPP_IP, NpMode::Pass) {
            tracing::error!(%device, error = %e, "failed to set NP mode");
            if self.fatal_ioctl {
                return Err(Error::Iface(e));
            }
        }

        tracing::info!(%device, %local, %peer, "interface programmed");
        Ok(())
    }

    fn put_tlv(buf: &mut BytesMut, addr: Ipv4Addr) {
        buf.put_u8(CI_ADDR);
        buf.put_u8(OPT_LEN as u8);
        buf.put_slice(&addr.octets());
    }
}

impl IpcpOption for AddrOption {
    fn id(&self) -> u8 {
        CI_ADDR
    }

    fn send_conf_req(&mut self, buf: &mut BytesMut) -> Result<()> {
        let local = match self.local {
            Some(local) => local,
            None => {
                let Some((local, peer)) = self.pool.get(self.session) else {
                    tracing::warn!(session = %self.session, "no free IP address");
                    return Err(Error::AddressExhausted);
                };
                self.leased = Some((local, peer));
                self.local = Some(local);
                // A proposal the peer already made wins over the lease.
                if self.peer.is_none() {
                    self.peer = Some(peer);
                }
                local
            }
        };
        Self::put_tlv(buf, local);
        Ok(())
    }

    fn send_conf_nak(&mut self, buf: &mut BytesMut) -> Result<()> {
        // Never nak with a zeroed address: a nak is only meaningful once a
        // peer address exists, from the pool or from the peer itself.
        let peer = self
            .peer
            .ok_or_else(|| Error::Protocol("conf-nak before peer address is known".into()))?;
        Self::put_tlv(buf, peer);
        Ok(())
    }

    fn recv_conf_req(&mut self, data: &[u8]) -> Verdict {
        if data.len() != OPT_LEN || data[1] as usize != OPT_LEN {
            return Verdict::Reject;
        }
        let proposed = Ipv4Addr::new(data[2], data[3], data[4], data[5]);

        if proposed.is_unspecified() {
            // Peer wants an assignment; steer it if we can, refuse the
            // option otherwise.
            return if self.peer.is_some() {
                Verdict::Nak
            } else {
                Verdict::Reject
            };
        }
        if self.peer == Some(proposed) {
            return Verdict::Ack;
        }
        if self.peer.is_none() {
            self.peer = Some(proposed);
            return Verdict::Ack;
        }
        Verdict::Nak
    }

    fn opened(&mut self) -> Result<()> {
        self.program_interface()
    }

    fn close(&mut self) {
        if let Some((local, peer)) = self.leased.take() {
            self.pool.put(self.session, local, peer);
        }
    }

    fn print(&self, data: Option<&[u8]>) -> String {
        let addr = match data {
            Some(tlv) if tlv.len() == OPT_LEN => {
                Some(Ipv4Addr::new(tlv[2], tlv[3], tlv[4], tlv[5]))
            }
            Some(_) => None,
            None => self.local,
        };
        match addr {
            Some(addr) => format!("<addr {addr}>"),
            None => "<addr ?>".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::{always, eq};
    use mockall::Sequence;

    use crate::config::IpcpConfig;
    use crate::iface::MockIfaceBackend;
    use crate::ipcp::{Ipcp, State, CONF_ACK, CONF_NAK, CONF_REQ};
    use crate::ipdb::MockIpPool;

    const LOCAL: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const PEER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

    fn pool_with_lease() -> MockIpPool {
        let mut pool = MockIpPool::new();
        pool.expect_get().times(1).returning(|_| Some((LOCAL, PEER)));
        pool.expect_put()
            .with(always(), eq(LOCAL), eq(PEER))
            .times(1)
            .return_const(());
        pool
    }

    fn iface_expecting_program() -> MockIfaceBackend {
        let mut iface = MockIfaceBackend::new();
        let mut seq = Sequence::new();
        iface
            .expect_set_local_addr()
            .withf(|_, addr| *addr == LOCAL)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        iface
            .expect_set_dest_addr()
            .withf(|_, addr| *addr == PEER)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        iface
            .expect_flags()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(0));
        iface
            .expect_set_flags()
            .withf(|_, flags| flags & (IFF_UP | IFF_POINTOPOINT) == (IFF_UP | IFF_POINTOPOINT))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        iface
            .expect_set_np_mode()
            .withf(|_, protocol, mode| *protocol == PPP_IP && *mode == NpMode::Pass)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));
        iface
    }

    fn resources(pool: MockIpPool, iface: MockIfaceBackend) -> LinkResources {
        LinkResources {
            session: Uuid::new_v4(),
            pool: Arc::new(pool),
            iface: Arc::new(iface),
            unit: PppUnit { index: 0, fd: -1 },
            fatal_ioctl: false,
        }
    }

    fn engine(res: &LinkResources) -> Ipcp {
        let mut registry = OptionRegistry::new();
        register(&mut registry);
        Ipcp::new(&IpcpConfig::default(), &registry, res)
    }

    fn frame(code: u8, id: u8, payload: &[u8]) -> Vec<u8> {
        let mut f = vec![code, id, 0, 0];
        f.extend_from_slice(payload);
        let len = f.len() as u16;
        f[2..4].copy_from_slice(&len.to_be_bytes());
        f
    }

    fn addr_tlv(addr: Ipv4Addr) -> Vec<u8> {
        let mut tlv = vec![CI_ADDR, 6];
        tlv.extend_from_slice(&addr.octets());
        tlv
    }

    #[test]
    fn happy_path_programs_the_interface() {
        let res = resources(pool_with_lease(), iface_expecting_program());
        let mut ipcp = engine(&res);

        ipcp.open().unwrap();
        let out = ipcp.take_output();
        assert_eq!(out[0][0], CONF_REQ);
        let our_id = out[0][1];
        assert_eq!(&out[0][4..], addr_tlv(LOCAL).as_slice());

        // Peer requests the address we hold for it.
        ipcp.input(&frame(CONF_REQ, 11, &addr_tlv(PEER))).unwrap();
        let out = ipcp.take_output();
        assert_eq!(out[0][0], CONF_ACK);
        assert_eq!(ipcp.state(), State::AckSent);

        // Peer accepts ours; interface programming happens exactly here.
        ipcp.input(&frame(CONF_ACK, our_id, &addr_tlv(LOCAL))).unwrap();
        assert_eq!(ipcp.state(), State::Opened);

        ipcp.close();
    }

    #[test]
    fn nak_loop_steers_the_peer_to_its_lease() {
        let res = resources(pool_with_lease(), iface_expecting_program());
        let mut ipcp = engine(&res);

        ipcp.open().unwrap();
        let our_id = ipcp.take_output()[0][1];

        // Peer proposes an address that is not its lease.
        ipcp.input(&frame(CONF_REQ, 1, &addr_tlv(Ipv4Addr::new(10, 0, 0, 9))))
            .unwrap();
        let out = ipcp.take_output();
        assert_eq!(out[0][0], CONF_NAK);
        assert_eq!(&out[0][4..], addr_tlv(PEER).as_slice());

        ipcp.input(&frame(CONF_ACK, our_id, &addr_tlv(LOCAL))).unwrap();
        assert_eq!(ipcp.state(), State::AckRcvd);

        // Peer re-proposes what we naked it toward.
        ipcp.input(&frame(CONF_REQ, 2, &addr_tlv(PEER))).unwrap();
        assert_eq!(ipcp.state(), State::Opened);

        ipcp.close();
    }

    #[test]
    fn pool_exhaustion_declines_the_layer() {
        let mut pool = MockIpPool::new();
        pool.expect_get().times(1).returning(|_| None);
        // No put: nothing was leased. No interface calls either.
        let res = resources(pool, MockIfaceBackend::new());
        let mut ipcp = engine(&res);

        let err = ipcp.open().unwrap_err();
        assert!(matches!(err, Error::AddressExhausted));
        assert_eq!(ipcp.state(), State::Closing);
        assert!(ipcp.take_output().is_empty());

        ipcp.close();
    }

    #[test]
    fn peer_proposal_is_adopted_when_unset() {
        let mut pool = MockIpPool::new();
        pool.expect_get().times(1).returning(|_| Some((LOCAL, PEER)));
        // The leased pair goes back even though the peer negotiated a
        // different address for itself.
        pool.expect_put()
            .with(always(), eq(LOCAL), eq(PEER))
            .times(1)
            .return_const(());

        let res = resources(pool, MockIfaceBackend::new());
        let mut opt = AddrOption::new(&res);

        // Proposal arrives before our first request was assembled.
        let theirs = Ipv4Addr::new(172, 16, 3, 3);
        assert_eq!(opt.recv_conf_req(&addr_tlv(theirs)), Verdict::Ack);

        let mut buf = BytesMut::new();
        opt.send_conf_req(&mut buf).unwrap();
        assert_eq!(&buf[..], addr_tlv(LOCAL).as_slice());
        // The adopted address survives the pool draw.
        assert_eq!(opt.recv_conf_req(&addr_tlv(theirs)), Verdict::Ack);

        opt.close();
    }

    #[test]
    fn nak_before_any_peer_address_is_a_protocol_error() {
        let res = resources(MockIpPool::new(), MockIfaceBackend::new());
        let mut opt = AddrOption::new(&res);
        let err = opt.send_conf_nak(&mut BytesMut::new()).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn short_tlv_is_rejected() {
        let res = resources(MockIpPool::new(), MockIfaceBackend::new());
        let mut opt = AddrOption::new(&res);
        assert_eq!(opt.recv_conf_req(&[CI_ADDR, 4, 10, 0]), Verdict::Reject);
    }

    #[test]
    fn unspecified_proposal_is_naked_when_we_hold_a_lease() {
        let mut pool = MockIpPool::new();
        pool.expect_get().times(1).returning(|_| Some((LOCAL, PEER)));
        pool.expect_put().times(1).return_const(());
        let res = resources(pool, MockIfaceBackend::new());
        let mut opt = AddrOption::new(&res);

        let mut buf = BytesMut::new();
        opt.send_conf_req(&mut buf).unwrap();

        assert_eq!(
            opt.recv_conf_req(&addr_tlv(Ipv4Addr::UNSPECIFIED)),
            Verdict::Nak
        );
        let mut nak = BytesMut::new();
        opt.send_conf_nak(&mut nak).unwrap();
        assert_eq!(&nak[..], addr_tlv(PEER).as_slice());

        opt.close();
    }

    #[test]
    fn ioctl_failures_are_tolerated_by_default() {
        let mut pool = MockIpPool::new();
        pool.expect_get().times(1).returning(|_| Some((LOCAL, PEER)));
        pool.expect_put().times(1).return_const(());

        let mut iface = MockIfaceBackend::new();
        iface
            .expect_set_local_addr()
            .times(1)
            .returning(|_, _| Err(std::io::Error::from_raw_os_error(libc::EPERM)));
        iface
            .expect_set_dest_addr()
            .times(1)
            .returning(|_, _| Ok(()));
        iface.expect_flags().times(1).returning(|_| Ok(0));
        iface.expect_set_flags().times(1).returning(|_, _| Ok(()));
        iface
            .expect_set_np_mode()
            .times(1)
            .returning(|_, _, _| Ok(()));

        let res = resources(pool, iface);
        let mut opt = AddrOption::new(&res);
        let mut buf = BytesMut::new();
        opt.send_conf_req(&mut buf).unwrap();
        assert_eq!(opt.recv_conf_req(&addr_tlv(PEER)), Verdict::Ack);

        // Default policy: the failed step is logged, the rest still run.
        opt.opened().unwrap();
        opt.close();
    }

    #[test]
    fn ioctl_failures_escalate_under_fatal_policy() {
        let mut pool = MockIpPool::new();
        pool.expect_get().times(1).returning(|_| Some((LOCAL, PEER)));
        pool.expect_put().times(1).return_const(());

        let mut iface = MockIfaceBackend::new();
        iface
            .expect_set_local_addr()
            .times(1)
            .returning(|_, _| Err(std::io::Error::from_raw_os_error(libc::EPERM)));

        let mut res = resources(pool, iface);
        res.fatal_ioctl = true;
        let mut opt = AddrOption::new(&res);
        let mut buf = BytesMut::new();
        opt.send_conf_req(&mut buf).unwrap();
        assert_eq!(opt.recv_conf_req(&addr_tlv(PEER)), Verdict::Ack);

        assert!(matches!(opt.opened(), Err(Error::Iface(_))));
        opt.close();
    }

    #[test]
    fn print_renders_the_proposed_address() {
        let res = resources(MockIpPool::new(), MockIfaceBackend::new());
        let opt = AddrOption::new(&res);
        assert_eq!(opt.print(Some(&addr_tlv(PEER))), "<addr 10.0.0.2>");
        assert_eq!(opt.print(None), "<addr ?>");
    }
}
