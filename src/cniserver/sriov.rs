// SR-IOV virtual-function representor discovery.
//
// Representors are created by the NIC driver in switchdev mode; the agent
// never creates one, it only resolves the PCI address handed in the network
// configuration to the pre-existing host-side link: PCI address -> uplink
// representor -> VF index -> VF representor. Each step fails with its own
// error so a broken uplink is distinguishable from a missing VF binding.

use crate::cniserver::error::CniError;
use std::fs;
use std::path::PathBuf;

pub struct SriovResolver {
    sysfs_root: PathBuf,
}

impl SriovResolver {
    pub fn new() -> Self {
        Self::with_sysfs_root("/sys")
    }

    /// Sysfs root override, used by tests to point at a fake tree.
    pub fn with_sysfs_root(root: impl Into<PathBuf>) -> Self {
        Self {
            sysfs_root: root.into(),
        }
    }

    /// Resolve a VF PCI address all the way to its representor link name.
    pub fn resolve_representor(&self, device_id: &str) -> Result<String, CniError> {
        let uplink = self.get_uplink_representor(device_id)?;
        let vf_index = self.get_vf_index(device_id)?;
        self.get_vf_representor(&uplink, vf_index)
    }

    /// The physical-function netdev backing a VF:
    /// bus/pci/devices/<addr>/physfn/net/<uplink>
    pub fn get_uplink_representor(&self, pci_address: &str) -> Result<String, CniError> {
        let net_dir = self
            .sysfs_root
            .join("bus/pci/devices")
            .join(pci_address)
            .join("physfn/net");

        let entries = fs::read_dir(&net_dir)
            .map_err(|_| CniError::UplinkRepresentorNotFound(pci_address.to_string()))?;
        for entry in entries.flatten() {
            if let Some(name) = entry.file_name().to_str() {
                return Ok(name.to_string());
            }
        }
        Err(CniError::UplinkRepresentorNotFound(pci_address.to_string()))
    }

    /// The VF's index on its physical function, recovered by matching the
    /// physfn's virtfn<N> symlinks back to the VF's own PCI address.
    pub fn get_vf_index(&self, pci_address: &str) -> Result<u32, CniError> {
        let physfn = self
            .sysfs_root
            .join("bus/pci/devices")
            .join(pci_address)
            .join("physfn");

        let entries = fs::read_dir(&physfn)
            .map_err(|_| CniError::VfIndexNotFound(pci_address.to_string()))?;
        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            let Some(index) = name.strip_prefix("virtfn") else {
                continue;
            };
            let Ok(target) = fs::read_link(entry.path()) else {
                continue;
            };
            if target.file_name().and_then(|f| f.to_str()) == Some(pci_address) {
                if let Ok(index) = index.parse::<u32>() {
                    return Ok(index);
                }
            }
        }
        Err(CniError::VfIndexNotFound(pci_address.to_string()))
    }

    /// The representor netdev for (uplink, VF index): a link on the same
    /// switch as the uplink whose phys_port_name ends in "vf<index>".
    pub fn get_vf_representor(&self, uplink: &str, vf_index: u32) -> Result<String, CniError> {
        let err = || CniError::VfRepresentorNotFound {
            uplink: uplink.to_string(),
            vf_index,
        };

        let class_net = self.sysfs_root.join("class/net");
        let switch_id = fs::read_to_string(class_net.join(uplink).join("phys_switch_id"))
            .map_err(|_| err())?;
        let switch_id = switch_id.trim();
        if switch_id.is_empty() {
            return Err(err());
        }

        let entries = fs::read_dir(&class_net).map_err(|_| err())?;
        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if name == uplink {
                continue;
            }
            let dev_switch_id = fs::read_to_string(entry.path().join("phys_switch_id"))
                .unwrap_or_default();
            if dev_switch_id.trim() != switch_id {
                continue;
            }
            let port_name = fs::read_to_string(entry.path().join("phys_port_name"))
                .unwrap_or_default();
            // phys_port_name is "pf<P>vf<N>"; match the vf suffix exactly so
            // vf1 does not match vf11
            if let Some((_, suffix)) = port_name.trim().rsplit_once("vf") {
                if suffix.parse::<u32>() == Ok(vf_index) {
                    return Ok(name.to_string());
                }
            }
        }
        Err(err())
    }
}

impl Default for SriovResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use std::path::Path;

    const VF_PCI: &str = "0000:3b:02.2";
    const PF_PCI: &str = "0000:3b:00.0";

    struct FakeSysfs {
        root: PathBuf,
    }

    impl FakeSysfs {
        fn new(tag: &str) -> Self {
            let root = std::env::temp_dir().join(format!(
                "weft-sriov-{}-{}",
                tag,
                std::process::id()
            ));
            let _ = fs::remove_dir_all(&root);
            fs::create_dir_all(&root).unwrap();
            Self { root }
        }

        fn pci_dev(&self, addr: &str) -> PathBuf {
            let dir = self.root.join("bus/pci/devices").join(addr);
            fs::create_dir_all(&dir).unwrap();
            dir
        }

        fn netdev(&self, name: &str, switch_id: &str, port_name: &str) {
            let dir = self.root.join("class/net").join(name);
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("phys_switch_id"), format!("{}\n", switch_id)).unwrap();
            fs::write(dir.join("phys_port_name"), format!("{}\n", port_name)).unwrap();
        }

        /// A complete healthy VF topology: PF with one netdev, the VF bound
        /// as virtfn2, a representor on the same switch.
        fn populate_healthy(&self) {
            let pf = self.pci_dev(PF_PCI);
            fs::create_dir_all(pf.join("net/enp59s0f0")).unwrap();

            let vf = self.pci_dev(VF_PCI);
            symlink(&vf, pf.join("virtfn2")).unwrap();
            symlink(&pf, vf.join("physfn")).unwrap();

            self.netdev("enp59s0f0", "00154d138f5e", "p0");
            self.netdev("enp59s0f0_2", "00154d138f5e", "pf0vf2");
            // Same switch, different VF: must not match
            self.netdev("enp59s0f0_11", "00154d138f5e", "pf0vf11");
        }
    }

    impl Drop for FakeSysfs {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.root);
        }
    }

    fn resolver(sysfs: &FakeSysfs) -> SriovResolver {
        SriovResolver::with_sysfs_root(&sysfs.root)
    }

    #[test]
    fn resolves_healthy_topology() {
        let sysfs = FakeSysfs::new("healthy");
        sysfs.populate_healthy();
        let r = resolver(&sysfs);

        assert_eq!(r.get_uplink_representor(VF_PCI).unwrap(), "enp59s0f0");
        assert_eq!(r.get_vf_index(VF_PCI).unwrap(), 2);
        assert_eq!(
            r.get_vf_representor("enp59s0f0", 2).unwrap(),
            "enp59s0f0_2"
        );
        assert_eq!(r.resolve_representor(VF_PCI).unwrap(), "enp59s0f0_2");
    }

    #[test]
    fn missing_physfn_fails_at_uplink_step() {
        let sysfs = FakeSysfs::new("nouplink");
        sysfs.pci_dev(VF_PCI);
        let err = resolver(&sysfs).get_uplink_representor(VF_PCI).unwrap_err();
        assert_eq!(
            err.to_string(),
            format!("failed to get uplink representor for PCI Address {}", VF_PCI)
        );
    }

    #[test]
    fn unbound_vf_fails_at_index_step() {
        let sysfs = FakeSysfs::new("novf");
        // physfn exists with a netdev but carries no virtfn symlink for us
        let pf = sysfs.pci_dev(PF_PCI);
        fs::create_dir_all(pf.join("net/enp59s0f0")).unwrap();
        let vf = sysfs.pci_dev(VF_PCI);
        symlink(&pf, vf.join("physfn")).unwrap();

        let r = resolver(&sysfs);
        assert_eq!(r.get_uplink_representor(VF_PCI).unwrap(), "enp59s0f0");
        let err = r.get_vf_index(VF_PCI).unwrap_err();
        assert_eq!(
            err.to_string(),
            format!("failed to get VF index for PCI Address {}", VF_PCI)
        );
    }

    #[test]
    fn missing_representor_fails_at_representor_step() {
        let sysfs = FakeSysfs::new("norep");
        sysfs.netdev("enp59s0f0", "00154d138f5e", "p0");
        // No pf0vf7 netdev on the switch
        let err = resolver(&sysfs)
            .get_vf_representor("enp59s0f0", 7)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "failed to get VF representor for uplink enp59s0f0 VF 7"
        );
    }

    #[test]
    fn vf_suffix_matches_exactly() {
        let sysfs = FakeSysfs::new("suffix");
        sysfs.netdev("enp59s0f0", "00154d138f5e", "p0");
        sysfs.netdev("enp59s0f0_11", "00154d138f5e", "pf0vf11");
        let err = resolver(&sysfs)
            .get_vf_representor("enp59s0f0", 1)
            .unwrap_err();
        assert!(matches!(err, CniError::VfRepresentorNotFound { .. }));
    }

    #[test]
    fn fake_sysfs_paths_stay_under_root() {
        let sysfs = FakeSysfs::new("root");
        sysfs.populate_healthy();
        assert!(Path::new(&sysfs.root).join("class/net/enp59s0f0_2").exists());
    }
}
