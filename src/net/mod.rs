pub mod netlink;

pub use netlink::{Nl, NlLink};

use crate::config::Config;
use crate::error::TaskResult;
use crate::task::TaskEnv;
use crate::util::gettid;
use log::trace;
use nix::unistd::Pid;
use std::net::IpAddr;

#[derive(Debug, Clone, Default)]
pub struct HostNetCfg {
    pub dev: String,
}

#[derive(Debug, Clone, Default)]
pub struct MacVlanNetCfg {
    pub master: String,
    pub name: String,
    /// Kernel macvlan mode name: private, vepa, bridge or passthru.
    pub kind: String,
    /// Empty means synthesize a stable address from hostname and names.
    pub hw: String,
    pub mtu: i32,
}

#[derive(Debug, Clone, Default)]
pub struct IpVlanNetCfg {
    pub master: String,
    pub name: String,
    /// l2, l3 or l3s.
    pub mode: String,
    pub mtu: i32,
}

#[derive(Debug, Clone, Default)]
pub struct VethNetCfg {
    pub bridge: String,
    /// Container-side interface name.
    pub name: String,
    pub hw: String,
    /// Host-side end, enslaved to the bridge.
    pub peer: String,
    pub mtu: i32,
}

#[derive(Debug, Clone, Default)]
pub struct IpVec {
    pub iface: String,
    /// None entries are placeholders and skipped silently.
    pub addr: Option<IpAddr>,
    pub prefix: u8,
}

#[derive(Debug, Clone, Default)]
pub struct GwVec {
    pub iface: String,
    pub addr: Option<IpAddr>,
}

#[derive(Debug, Clone)]
pub struct NetCfg {
    pub new_net_ns: bool,
    pub inherited: bool,
    pub host: bool,
    pub host_iface: Vec<HostNetCfg>,
    pub mac_vlan: Vec<MacVlanNetCfg>,
    pub ip_vlan: Vec<IpVlanNetCfg>,
    pub veth: Vec<VethNetCfg>,
    pub net_ns_name: String,
}

impl Default for NetCfg {
    /* The default is a new empty network namespace. */
    fn default() -> NetCfg {
        NetCfg {
            new_net_ns: true,
            inherited: false,
            host: false,
            host_iface: Vec::new(),
            mac_vlan: Vec::new(),
            ip_vlan: Vec::new(),
            veth: Vec::new(),
            net_ns_name: String::new(),
        }
    }
}

impl NetCfg {
    /// All configured devices as one polymorphic sequence, in the order
    /// they are wired into the namespace.
    pub fn devices(&self) -> impl Iterator<Item = NetDevice<'_>> {
        self.host_iface
            .iter()
            .map(NetDevice::Host)
            .chain(self.ip_vlan.iter().map(NetDevice::IpVlan))
            .chain(self.mac_vlan.iter().map(NetDevice::MacVlan))
            .chain(self.veth.iter().map(NetDevice::Veth))
    }
}

/// One network device to be wired into the container namespace. The
/// variants share a single materialize step run by the intermediate
/// against the init's fresh netns.
pub enum NetDevice<'a> {
    Host(&'a HostNetCfg),
    MacVlan(&'a MacVlanNetCfg),
    IpVlan(&'a IpVlanNetCfg),
    Veth(&'a VethNetCfg),
}

impl NetDevice<'_> {
    /// Create (or find) the device in the host namespace and move it into
    /// `target`'s namespace. vlan devices are created under a transient
    /// per-thread name and renamed on the way in, so concurrent launches
    /// never collide.
    pub fn materialize(
        &self,
        nl: &mut Nl,
        target: Pid,
        hostname: &str,
        config: &Config,
    ) -> TaskResult<()> {
        match self {
            NetDevice::Host(host) => nl.link(host.dev.as_str()).change_ns(&host.dev, target),

            NetDevice::IpVlan(ipvlan) => {
                let transient = format!("piv{}", gettid());
                let mut link = nl.link(transient);
                let _ = link.remove();

                link.add_ip_vlan(&ipvlan.master, &ipvlan.mode, ipvlan.mtu)?;

                link.change_ns(&ipvlan.name, target).inspect_err(|_| {
                    let _ = link.remove();
                })
            }

            NetDevice::MacVlan(mvlan) => {
                let transient = format!("pmv{}", gettid());
                let mut link = nl.link(transient);
                let _ = link.remove();

                let hw = if mvlan.hw.is_empty() {
                    generate_hw(hostname, &format!("{}{}", mvlan.master, mvlan.name))
                } else {
                    mvlan.hw.clone()
                };
                trace!("Using {} for {}@{}", hw, mvlan.name, mvlan.master);

                link.add_mac_vlan(&mvlan.master, &mvlan.kind, &hw, mvlan.mtu)?;

                link.change_ns(&mvlan.name, target).inspect_err(|_| {
                    let _ = link.remove();
                })
            }

            NetDevice::Veth(veth) => {
                let bridge_index = nl.link(veth.bridge.as_str()).load()?;

                let hw = if veth.hw.is_empty() {
                    generate_hw(hostname, &format!("{}{}", veth.name, veth.peer))
                } else {
                    veth.hw.clone()
                };
                if config.network_debug {
                    trace!("Using {} for {} -> {}", hw, veth.name, veth.peer);
                }

                nl.link(veth.peer.as_str())
                    .add_veth(bridge_index, &veth.name, &hw, veth.mtu, target)
            }
        }
    }
}

/// Stable locally-administered hardware address: a pure function of the
/// container hostname and the device naming, so identical launches get
/// identical addresses across restarts.
pub fn generate_hw(host: &str, name: &str) -> String {
    let n = crc32fast::hash(name.as_bytes());
    let h = crc32fast::hash(host.as_bytes());

    format!(
        "02:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        n & 0x0000_00ff,
        (h & 0xff00_0000) >> 24,
        (h & 0x00ff_0000) >> 16,
        (h & 0x0000_ff00) >> 8,
        h & 0x0000_00ff,
    )
}

/// Host-namespace half of the network build, run by the intermediate
/// once the init's netns exists.
pub fn isolate_net(env: &TaskEnv, child: Pid, config: &Config) -> TaskResult<()> {
    let mut nl = Nl::connect()?;

    for device in env.net_cfg.devices() {
        device.materialize(&mut nl, child, &env.hostname, config)?;
    }

    Ok(())
}

/// Container-namespace half: bring every present link up and apply the
/// matching addresses and default gateways. Placeholder entries with no
/// address are skipped.
pub fn enable_net(env: &TaskEnv) -> TaskResult<()> {
    let mut nl = Nl::connect()?;

    for dev in nl.find_links()? {
        nl.link(dev.as_str()).up()?;

        for ip in &env.ip_vec {
            let addr = match ip.addr {
                Some(addr) => addr,
                None => continue,
            };
            if ip.iface == dev {
                nl.link(dev.as_str()).set_ip_addr(addr, ip.prefix)?;
            }
        }

        for gw in &env.gw_vec {
            let addr = match gw.addr {
                Some(addr) => addr,
                None => continue,
            };
            if gw.iface == dev {
                nl.link(dev.as_str()).set_default_gw(addr)?;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_hw_is_deterministic() {
        let a = generate_hw("c1", "eth0br0");
        let b = generate_hw("c1", "eth0br0");
        assert_eq!(a, b);
    }

    #[test]
    fn test_generate_hw_is_locally_administered() {
        let hw = generate_hw("host", "dev");
        assert!(hw.starts_with("02:"));
        assert_eq!(hw.len(), 17);
    }

    #[test]
    fn test_generate_hw_varies_by_input() {
        assert_ne!(generate_hw("c1", "eth0br0"), generate_hw("c2", "eth0br0"));
        assert_ne!(generate_hw("c1", "eth0br0"), generate_hw("c1", "eth1br0"));
    }

    #[test]
    fn test_default_netcfg_is_empty_netns() {
        let cfg = NetCfg::default();
        assert!(cfg.new_net_ns);
        assert!(!cfg.host);
        assert!(!cfg.inherited);
        assert_eq!(cfg.devices().count(), 0);
    }

    #[test]
    fn test_device_ordering() {
        let cfg = NetCfg {
            veth: vec![VethNetCfg::default()],
            host_iface: vec![HostNetCfg::default()],
            ip_vlan: vec![IpVlanNetCfg::default()],
            ..NetCfg::default()
        };

        let kinds: Vec<&str> = cfg
            .devices()
            .map(|d| match d {
                NetDevice::Host(_) => "host",
                NetDevice::IpVlan(_) => "ipvlan",
                NetDevice::MacVlan(_) => "macvlan",
                NetDevice::Veth(_) => "veth",
            })
            .collect();
        assert_eq!(kinds, vec!["host", "ipvlan", "veth"]);
    }
}
