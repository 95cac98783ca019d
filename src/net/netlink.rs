use crate::error::{TaskError, TaskResult};
use netlink_packet_core::{
    NetlinkBuffer, NetlinkMessage, NetlinkPayload, NLM_F_ACK, NLM_F_CREATE, NLM_F_DUMP,
    NLM_F_EXCL, NLM_F_REQUEST,
};
use netlink_packet_route::address::nlas::Nla as AddressNla;
use netlink_packet_route::link::nlas::{
    Info, InfoData, InfoIpVlan, InfoKind, InfoMacVlan, Nla as LinkNla, VethInfo,
};
use netlink_packet_route::route::nlas::Nla as RouteNla;
use netlink_packet_route::{
    AddressMessage, LinkMessage, RouteMessage, RtnlMessage, AF_INET, AF_INET6, IFF_UP,
    RTN_UNICAST, RTPROT_BOOT, RT_SCOPE_UNIVERSE, RT_TABLE_MAIN,
};
use netlink_sys::{protocols::NETLINK_ROUTE, Socket, SocketAddr};
use nix::errno::Errno;
use nix::unistd::Pid;
use std::net::IpAddr;

/* Kernel macvlan/ipvlan mode values, from <linux/if_link.h>. */
const MACVLAN_MODE_PRIVATE: u32 = 1;
const MACVLAN_MODE_VEPA: u32 = 2;
const MACVLAN_MODE_BRIDGE: u32 = 4;
const MACVLAN_MODE_PASSTHRU: u32 = 8;

const IPVLAN_MODE_L2: u16 = 0;
const IPVLAN_MODE_L3: u16 = 1;
const IPVLAN_MODE_L3S: u16 = 2;

pub fn macvlan_mode(kind: &str) -> TaskResult<u32> {
    match kind {
        "private" => Ok(MACVLAN_MODE_PRIVATE),
        "vepa" => Ok(MACVLAN_MODE_VEPA),
        "bridge" => Ok(MACVLAN_MODE_BRIDGE),
        "passthru" => Ok(MACVLAN_MODE_PASSTHRU),
        _ => Err(TaskError::invalid(format!("invalid macvlan type: {}", kind))),
    }
}

pub fn ipvlan_mode(mode: &str) -> TaskResult<u16> {
    match mode {
        "l2" => Ok(IPVLAN_MODE_L2),
        "l3" => Ok(IPVLAN_MODE_L3),
        "l3s" => Ok(IPVLAN_MODE_L3S),
        _ => Err(TaskError::invalid(format!("invalid ipvlan mode: {}", mode))),
    }
}

/// "02:xx:xx:xx:xx:xx" to raw bytes.
pub fn parse_hw_addr(hw: &str) -> TaskResult<Vec<u8>> {
    let bytes: Result<Vec<u8>, _> = hw
        .split(':')
        .map(|part| u8::from_str_radix(part, 16))
        .collect();
    match bytes {
        Ok(bytes) if bytes.len() == 6 => Ok(bytes),
        _ => Err(TaskError::invalid(format!("invalid hw address: {}", hw))),
    }
}

/// Synchronous rtnetlink channel. One socket per builder pass; the
/// requests the engine sends are all small and acked.
pub struct Nl {
    socket: Socket,
    seq: u32,
}

impl Nl {
    pub fn connect() -> TaskResult<Nl> {
        let mut socket = Socket::new(NETLINK_ROUTE)
            .map_err(|e| io_error(&e, "socket(NETLINK_ROUTE)"))?;
        socket
            .bind_auto()
            .map_err(|e| io_error(&e, "bind(NETLINK_ROUTE)"))?;
        socket
            .connect(&SocketAddr::new(0, 0))
            .map_err(|e| io_error(&e, "connect(NETLINK_ROUTE)"))?;

        Ok(Nl { socket, seq: 0 })
    }

    fn send(&mut self, payload: RtnlMessage, flags: u16) -> TaskResult<u32> {
        self.seq += 1;
        let mut message = NetlinkMessage::from(payload);
        message.header.flags = NLM_F_REQUEST | flags;
        message.header.sequence_number = self.seq;
        message.finalize();

        let mut buf = vec![0u8; message.buffer_len()];
        message.serialize(&mut buf);

        self.socket
            .send(&buf, 0)
            .map_err(|e| io_error(&e, "send rtnetlink request"))?;

        Ok(self.seq)
    }

    /* Collect replies until the kernel acks (or errors) the request. For
     * dumps, until the Done record. */
    fn receive(&mut self, dump: bool) -> TaskResult<Vec<RtnlMessage>> {
        let mut replies = Vec::new();

        loop {
            let mut buf = vec![0u8; 16384];
            let size = self
                .socket
                .recv(&mut &mut buf[..], 0)
                .map_err(|e| io_error(&e, "recv rtnetlink reply"))?;

            let mut offset = 0;
            while offset < size {
                if size - offset < 16 {
                    return Err(TaskError::invalid("truncated rtnetlink reply"));
                }
                let length = NetlinkBuffer::new(&buf[offset..]).length() as usize;
                if length == 0 || offset + length > size {
                    return Err(TaskError::invalid("truncated rtnetlink reply"));
                }

                let message =
                    NetlinkMessage::<RtnlMessage>::deserialize(&buf[offset..offset + length])
                        .map_err(|e| {
                            TaskError::invalid(format!("parse rtnetlink reply: {}", e))
                        })?;

                match message.payload {
                    NetlinkPayload::Error(err) if err.code != 0 => {
                        return Err(TaskError::os(
                            Errno::from_raw(-err.code),
                            "rtnetlink request refused",
                        ));
                    }
                    NetlinkPayload::Error(_) | NetlinkPayload::Ack(_) => {
                        if !dump {
                            return Ok(replies);
                        }
                    }
                    NetlinkPayload::Done => return Ok(replies),
                    NetlinkPayload::InnerMessage(inner) => replies.push(inner),
                    _ => {}
                }

                offset += length;
            }
        }
    }

    fn request_ack(&mut self, payload: RtnlMessage, extra_flags: u16) -> TaskResult<()> {
        self.send(payload, NLM_F_ACK | extra_flags)?;
        self.receive(false)?;
        Ok(())
    }

    fn dump_links(&mut self) -> TaskResult<Vec<LinkMessage>> {
        self.send(RtnlMessage::GetLink(LinkMessage::default()), NLM_F_DUMP)?;
        let replies = self.receive(true)?;

        Ok(replies
            .into_iter()
            .filter_map(|reply| match reply {
                RtnlMessage::NewLink(link) => Some(link),
                _ => None,
            })
            .collect())
    }

    /// Names of every link in the current network namespace.
    pub fn find_links(&mut self) -> TaskResult<Vec<String>> {
        Ok(self
            .dump_links()?
            .into_iter()
            .filter_map(|link| link_name(&link))
            .collect())
    }

    fn link_index(&mut self, name: &str) -> TaskResult<u32> {
        self.dump_links()?
            .into_iter()
            .find(|link| link_name(link).as_deref() == Some(name))
            .map(|link| link.header.index)
            .ok_or_else(|| TaskError::os(Errno::ENODEV, format!("no such link: {}", name)))
    }

    pub fn link(&mut self, name: impl Into<String>) -> NlLink<'_> {
        NlLink {
            nl: self,
            name: name.into(),
        }
    }
}

fn link_name(link: &LinkMessage) -> Option<String> {
    link.nlas.iter().find_map(|nla| match nla {
        LinkNla::IfName(name) => Some(name.clone()),
        _ => None,
    })
}

fn io_error(e: &std::io::Error, what: &str) -> TaskError {
    TaskError::os(Errno::from_raw(e.raw_os_error().unwrap_or(0)), what)
}

/// One named link in the current namespace, addressed through the shared
/// socket. Mirrors the §6 primitive operations one to one.
pub struct NlLink<'a> {
    nl: &'a mut Nl,
    name: String,
}

impl NlLink<'_> {
    /// Verify the link exists (bridges are looked up before veth pairs
    /// are attached to them).
    pub fn load(&mut self) -> TaskResult<u32> {
        self.nl.link_index(&self.name)
    }

    pub fn remove(&mut self) -> TaskResult<()> {
        let mut message = LinkMessage::default();
        message.nlas.push(LinkNla::IfName(self.name.clone()));
        self.nl.request_ack(RtnlMessage::DelLink(message), 0)
    }

    /// Create an ipvlan slave of `master` under this link's name.
    pub fn add_ip_vlan(&mut self, master: &str, mode: &str, mtu: i32) -> TaskResult<()> {
        let mode = ipvlan_mode(mode)?;
        let master_index = self.nl.link_index(master)?;

        let mut message = LinkMessage::default();
        message.nlas.push(LinkNla::IfName(self.name.clone()));
        message.nlas.push(LinkNla::Link(master_index));
        if mtu > 0 {
            message.nlas.push(LinkNla::Mtu(mtu as u32));
        }
        message.nlas.push(LinkNla::Info(vec![
            Info::Kind(InfoKind::IpVlan),
            Info::Data(InfoData::IpVlan(vec![InfoIpVlan::Mode(mode)])),
        ]));

        self.nl
            .request_ack(RtnlMessage::NewLink(message), NLM_F_CREATE | NLM_F_EXCL)
    }

    /// Create a macvlan slave of `master` under this link's name.
    pub fn add_mac_vlan(
        &mut self,
        master: &str,
        kind: &str,
        hw: &str,
        mtu: i32,
    ) -> TaskResult<()> {
        let mode = macvlan_mode(kind)?;
        let master_index = self.nl.link_index(master)?;

        let mut message = LinkMessage::default();
        message.nlas.push(LinkNla::IfName(self.name.clone()));
        message.nlas.push(LinkNla::Link(master_index));
        if mtu > 0 {
            message.nlas.push(LinkNla::Mtu(mtu as u32));
        }
        if !hw.is_empty() {
            message.nlas.push(LinkNla::Address(parse_hw_addr(hw)?));
        }
        message.nlas.push(LinkNla::Info(vec![
            Info::Kind(InfoKind::MacVlan),
            Info::Data(InfoData::MacVlan(vec![InfoMacVlan::Mode(mode)])),
        ]));

        self.nl
            .request_ack(RtnlMessage::NewLink(message), NLM_F_CREATE | NLM_F_EXCL)
    }

    /// Create a veth pair: this link stays in the host namespace enslaved
    /// to the bridge, the peer lands in `target`'s namespace under
    /// `peer_name` with the given address and mtu.
    pub fn add_veth(
        &mut self,
        bridge_index: u32,
        peer_name: &str,
        hw: &str,
        mtu: i32,
        target: Pid,
    ) -> TaskResult<()> {
        let mut peer = LinkMessage::default();
        peer.nlas.push(LinkNla::IfName(peer_name.to_string()));
        peer.nlas.push(LinkNla::NetNsPid(target.as_raw() as u32));
        if mtu > 0 {
            peer.nlas.push(LinkNla::Mtu(mtu as u32));
        }
        if !hw.is_empty() {
            peer.nlas.push(LinkNla::Address(parse_hw_addr(hw)?));
        }

        let mut message = LinkMessage::default();
        message.nlas.push(LinkNla::IfName(self.name.clone()));
        message.nlas.push(LinkNla::Master(bridge_index));
        message.nlas.push(LinkNla::Info(vec![
            Info::Kind(InfoKind::Veth),
            Info::Data(InfoData::Veth(VethInfo::Peer(peer))),
        ]));

        self.nl
            .request_ack(RtnlMessage::NewLink(message), NLM_F_CREATE | NLM_F_EXCL)
    }

    /// Move the link into `target`'s network namespace under a new name.
    pub fn change_ns(&mut self, new_name: &str, target: Pid) -> TaskResult<()> {
        let index = self.nl.link_index(&self.name)?;

        let mut message = LinkMessage::default();
        message.header.index = index;
        message.nlas.push(LinkNla::IfName(new_name.to_string()));
        message.nlas.push(LinkNla::NetNsPid(target.as_raw() as u32));

        self.nl.request_ack(RtnlMessage::SetLink(message), 0)
    }

    pub fn up(&mut self) -> TaskResult<()> {
        let index = self.nl.link_index(&self.name)?;

        let mut message = LinkMessage::default();
        message.header.index = index;
        message.header.flags |= IFF_UP;
        message.header.change_mask |= IFF_UP;

        self.nl.request_ack(RtnlMessage::SetLink(message), 0)
    }

    pub fn set_ip_addr(&mut self, addr: IpAddr, prefix: u8) -> TaskResult<()> {
        let index = self.nl.link_index(&self.name)?;

        let mut message = AddressMessage::default();
        message.header.index = index;
        message.header.prefix_len = prefix;
        let bytes = match addr {
            IpAddr::V4(v4) => {
                message.header.family = AF_INET as u8;
                v4.octets().to_vec()
            }
            IpAddr::V6(v6) => {
                message.header.family = AF_INET6 as u8;
                v6.octets().to_vec()
            }
        };
        message.nlas.push(AddressNla::Local(bytes.clone()));
        message.nlas.push(AddressNla::Address(bytes));

        self.nl
            .request_ack(RtnlMessage::NewAddress(message), NLM_F_CREATE | NLM_F_EXCL)
    }

    pub fn set_default_gw(&mut self, addr: IpAddr) -> TaskResult<()> {
        let index = self.nl.link_index(&self.name)?;

        let mut message = RouteMessage::default();
        message.header.table = RT_TABLE_MAIN as u8;
        message.header.protocol = RTPROT_BOOT as u8;
        message.header.scope = RT_SCOPE_UNIVERSE as u8;
        message.header.kind = RTN_UNICAST as u8;
        message.header.destination_prefix_length = 0;
        let bytes = match addr {
            IpAddr::V4(v4) => {
                message.header.address_family = AF_INET as u8;
                v4.octets().to_vec()
            }
            IpAddr::V6(v6) => {
                message.header.address_family = AF_INET6 as u8;
                v6.octets().to_vec()
            }
        };
        message.nlas.push(RouteNla::Gateway(bytes));
        message.nlas.push(RouteNla::Oif(index));

        self.nl
            .request_ack(RtnlMessage::NewRoute(message), NLM_F_CREATE | NLM_F_EXCL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hw_addr() {
        assert_eq!(
            parse_hw_addr("02:00:ab:cd:ef:01").expect("valid"),
            vec![0x02, 0x00, 0xab, 0xcd, 0xef, 0x01]
        );
        assert!(parse_hw_addr("02:00:ab").is_err());
        assert!(parse_hw_addr("zz:00:ab:cd:ef:01").is_err());
    }

    #[test]
    fn test_modes() {
        assert_eq!(macvlan_mode("bridge").expect("bridge"), MACVLAN_MODE_BRIDGE);
        assert_eq!(ipvlan_mode("l3").expect("l3"), IPVLAN_MODE_L3);
        assert!(macvlan_mode("loop").is_err());
        assert!(ipvlan_mode("l4").is_err());
    }

    #[test]
    fn test_find_links_sees_loopback() {
        /* Creating a netlink socket and dumping links needs no
         * privilege; every namespace has at least lo. */
        let mut nl = Nl::connect().expect("connect");
        let links = nl.find_links().expect("dump");
        assert!(links.iter().any(|name| name == "lo"));
    }
}
