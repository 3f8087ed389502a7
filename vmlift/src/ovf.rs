//! OVF documents: parsing (OVA input) and generation (oVirt/RHV
//! flavour, §ovf:Envelope version 0.9).
//!
//! The parser is deliberately lenient: it accepts both the VMware OVF
//! 1.x dialect found inside OVAs and the 0.9 flavour this tool emits,
//! matching elements by local name so namespace prefixes do not matter.

use chrono::Utc;
use uuid::Uuid;

use crate::xml::{Element, local_name};
use crate::{Error, Result};

/// RASD resource types used in the hardware section.
mod resource {
    pub const SOUND: &str = "0";
    pub const CPU: &str = "3";
    pub const MEMORY: &str = "4";
    pub const NIC: &str = "10";
    pub const FLOPPY: &str = "14";
    pub const CDROM: &str = "15";
    pub const DISK: &str = "17";
    pub const VIDEO: &str = "20";
    pub const USB: &str = "23";
}

/// One disk as described by an OVF document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OvfDisk {
    /// `DiskSection` identifier.
    pub disk_id: String,
    /// Referenced file `href`, when the disk has an extent file.
    pub href: Option<String>,
    /// Capacity in bytes.
    pub capacity: u64,
    /// Format URL or token, when declared.
    pub format: Option<String>,
}

/// One NIC as described by an OVF document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OvfNic {
    /// Connected network name.
    pub network: String,
    /// Resource subtype (`1`/`2`/`3` in the RHV flavour, or a device
    /// name like `E1000` in the VMware flavour).
    pub subtype: Option<String>,
    /// MAC address, when declared.
    pub mac: Option<String>,
}

/// A parsed OVF virtual system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OvfVm {
    /// System name.
    pub name: String,
    /// Memory in MiB.
    pub memory_mb: u64,
    /// vCPU count.
    pub vcpus: u32,
    /// Whether the firmware is EFI.
    pub firmware_efi: bool,
    /// `VmType` 1 (Server) vs 0 (Desktop), when declared.
    pub vm_type_server: Option<bool>,
    /// `Origin` tag, when declared.
    pub origin: Option<u32>,
    /// OS token from the operating-system section.
    pub os_description: Option<String>,
    /// Disks in hardware-item order.
    pub disks: Vec<OvfDisk>,
    /// NICs in hardware-item order.
    pub nics: Vec<OvfNic>,
    /// Number of CD-ROM items.
    pub cdroms: usize,
    /// Number of floppy items.
    pub floppies: usize,
    /// Sound device, when declared.
    pub sound: Option<String>,
}

/// Finds a descendant element by local-name path.
fn descend<'a>(el: &'a Element, path: &[&str]) -> Option<&'a Element> {
    let mut cur = el;
    for p in path {
        cur = cur.find_local(p)?;
    }
    Some(cur)
}

/// Text of the first child matching a local name.
fn child_text_local<'a>(el: &'a Element, local: &str) -> Option<&'a str> {
    el.find_local(local).map(|c| c.text.as_str())
}

/// Parses an OVF envelope (any dialect this tool understands).
pub fn parse_ovf(root: &Element) -> Result<OvfVm> {
    if local_name(&root.name) != "Envelope" {
        return Err(Error::Input(format!(
            "expected an OVF Envelope, found <{}>",
            root.name
        )));
    }

    // File references: id -> href.
    let mut hrefs = Vec::new();
    if let Some(refs) = root.find_local("References") {
        for file in refs.children.iter().filter(|c| local_name(&c.name) == "File") {
            let id = file.attr_local("id").unwrap_or("").to_owned();
            let href = file.attr_local("href").unwrap_or("").to_owned();
            hrefs.push((id, href));
        }
    }

    // Disk section: diskId -> (fileRef, capacity, format).
    let disk_section = root
        .children
        .iter()
        .find(|c| {
            local_name(&c.name) == "DiskSection"
                || (local_name(&c.name) == "Section"
                    && c.attr_local("type").is_some_and(|t| t.ends_with("DiskSection_Type")))
        });
    let mut disk_meta = Vec::new();
    if let Some(section) = disk_section {
        for d in section.children.iter().filter(|c| local_name(&c.name) == "Disk") {
            let disk_id = d.attr_local("diskId").unwrap_or("").to_owned();
            let file_ref = d.attr_local("fileRef").map(str::to_owned);
            let capacity = parse_capacity(
                d.attr_local("capacity").unwrap_or("0"),
                d.attr_local("capacityAllocationUnits"),
            );
            let format = d.attr_local("format").map(str::to_owned);
            disk_meta.push((disk_id, file_ref, capacity, format));
        }
    }

    // The virtual system: <VirtualSystem> (1.x) or <Content> (0.9).
    let system = root
        .find_local("VirtualSystem")
        .or_else(|| root.find_local("Content"))
        .ok_or_else(|| Error::Input("OVF has no VirtualSystem/Content".into()))?;

    let name = child_text_local(system, "Name")
        .or_else(|| system.attr_local("id"))
        .unwrap_or("import")
        .to_owned();

    let os_section = system.children.iter().find(|c| {
        local_name(&c.name) == "OperatingSystemSection"
            || (local_name(&c.name) == "Section"
                && c.attr_local("type")
                    .is_some_and(|t| t.ends_with("OperatingSystemSection_Type")))
    });
    let os_description = os_section
        .and_then(|s| child_text_local(s, "Description"))
        .map(str::to_owned);

    let hw = system
        .children
        .iter()
        .find(|c| {
            local_name(&c.name) == "VirtualHardwareSection"
                || (local_name(&c.name) == "Section"
                    && c.attr_local("type")
                        .is_some_and(|t| t.ends_with("VirtualHardwareSection_Type")))
        })
        .ok_or_else(|| Error::Input("OVF has no VirtualHardwareSection".into()))?;

    let mut memory_mb = 0u64;
    let mut vcpus = 1u32;
    let mut disks = Vec::new();
    let mut nics = Vec::new();
    let mut cdroms = 0usize;
    let mut floppies = 0usize;
    let mut sound = None;

    for item in hw.children.iter().filter(|c| local_name(&c.name) == "Item") {
        let rtype = child_text_local(item, "ResourceType").unwrap_or("");
        match rtype {
            resource::CPU => {
                if let Some(q) = child_text_local(item, "VirtualQuantity")
                    .or_else(|| child_text_local(item, "num_of_sockets"))
                {
                    vcpus = q.parse().unwrap_or(1);
                }
                // The RHV flavour stores sockets * cores.
                if let (Some(s), Some(c)) = (
                    child_text_local(item, "num_of_sockets"),
                    child_text_local(item, "cpu_per_socket"),
                ) {
                    vcpus = s.parse().unwrap_or(1) * c.parse().unwrap_or(1);
                }
            }
            resource::MEMORY => {
                memory_mb = child_text_local(item, "VirtualQuantity")
                    .and_then(|q| q.parse().ok())
                    .unwrap_or(0);
            }
            resource::DISK => {
                let host_resource = child_text_local(item, "HostResource").unwrap_or("");
                let disk_id = host_resource
                    .rsplit('/')
                    .next()
                    .unwrap_or(host_resource)
                    .to_owned();
                let meta = disk_meta
                    .iter()
                    .find(|(id, _, _, _)| *id == disk_id || disk_id.is_empty());
                let (href, capacity, format) = match meta {
                    Some((_, file_ref, capacity, format)) => {
                        let href = file_ref.as_ref().and_then(|fr| {
                            hrefs
                                .iter()
                                .find(|(id, _)| id == fr)
                                .map(|(_, href)| href.clone())
                        });
                        (href, *capacity, format.clone())
                    }
                    None => (None, 0, None),
                };
                disks.push(OvfDisk {
                    disk_id,
                    href,
                    capacity,
                    format,
                });
            }
            resource::NIC => {
                nics.push(OvfNic {
                    network: child_text_local(item, "Connection")
                        .unwrap_or("")
                        .to_owned(),
                    subtype: child_text_local(item, "ResourceSubType").map(str::to_owned),
                    mac: child_text_local(item, "MACAddress").map(str::to_owned),
                });
            }
            resource::CDROM => cdroms += 1,
            resource::FLOPPY => floppies += 1,
            resource::SOUND => {
                sound = child_text_local(item, "Device").map(str::to_owned);
            }
            _ => {}
        }
    }

    // Disks declared in the DiskSection but not in the hardware items
    // (some exporters skip the items) still count, in section order.
    if disks.is_empty() {
        for (disk_id, file_ref, capacity, format) in &disk_meta {
            let href = file_ref.as_ref().and_then(|fr| {
                hrefs
                    .iter()
                    .find(|(id, _)| id == fr)
                    .map(|(_, href)| href.clone())
            });
            disks.push(OvfDisk {
                disk_id: disk_id.clone(),
                href,
                capacity: *capacity,
                format: format.clone(),
            });
        }
    }

    let firmware_efi = descend(system, &["VirtualHardwareSection", "System", "VirtualSystemType"])
        .map(|e| e.text.contains("efi"))
        .unwrap_or(false)
        || child_text_local(system, "BiosType").is_some_and(|b| b.contains("UEFI"));

    let vm_type_server = child_text_local(system, "VmType").map(|t| t == "1");
    let origin = child_text_local(system, "Origin").and_then(|o| o.parse().ok());

    Ok(OvfVm {
        name,
        memory_mb,
        vcpus,
        firmware_efi,
        vm_type_server,
        origin,
        os_description,
        disks,
        nics,
        cdroms,
        floppies,
        sound,
    })
}

/// Parses `capacity` with its allocation units (`byte * 2^20` style).
fn parse_capacity(capacity: &str, units: Option<&str>) -> u64 {
    let base: u64 = capacity.parse().unwrap_or(0);
    let Some(units) = units else { return base };
    // The only unit grammar seen in the wild: `byte * 2^N`.
    let mult = units
        .rsplit('^')
        .next()
        .and_then(|e| e.trim().parse::<u32>().ok())
        .map_or(1u64, |e| 1u64 << e);
    base * mult
}

// ---------------------------------------------------------------------------
// RHV-flavour generation
// ---------------------------------------------------------------------------

/// Everything the envelope builder needs for one disk.
#[derive(Debug, Clone)]
pub struct OvfDiskOut {
    /// Image UUID (directory component).
    pub image_uuid: Uuid,
    /// Volume UUID (file component).
    pub vol_uuid: Uuid,
    /// Virtual size in bytes.
    pub virtual_size: u64,
    /// Actual size in bytes, when measured.
    pub actual_size: Option<u64>,
    /// `RAW` or `COW`.
    pub format: String,
    /// Boot flag (first disk).
    pub bootable: bool,
}

/// Everything the envelope builder needs for one NIC.
#[derive(Debug, Clone)]
pub struct OvfNicOut {
    /// Device name inside the guest (`eth0`, …).
    pub dev: String,
    /// Resource subtype: `1`=rtl8139, `2`=e1000, `3`=virtio.
    pub subtype: String,
    /// Mapped network name.
    pub network: String,
    /// MAC address, when known.
    pub mac: Option<String>,
}

/// Inputs for [`build_envelope`].
#[derive(Debug, Clone)]
pub struct OvfParams {
    /// Guest name.
    pub name: String,
    /// Memory in bytes.
    pub memory: u64,
    /// vCPU count.
    pub vcpus: u32,
    /// `VmType` server flag (1) vs desktop (0).
    pub server: bool,
    /// Source hypervisor `Origin` tag, when known.
    pub origin: Option<u32>,
    /// OS token for the OperatingSystemSection description.
    pub os_token: String,
    /// EFI firmware.
    pub firmware_efi: bool,
    /// Storage-domain UUID.
    pub sd_uuid: Uuid,
    /// VM UUID.
    pub vm_uuid: Uuid,
    /// Fresh per-run snapshot id.
    pub vm_snapshot_id: Uuid,
    /// Disks in bus order.
    pub disks: Vec<OvfDiskOut>,
    /// NICs in order.
    pub nics: Vec<OvfNicOut>,
    /// Sound device (`ac97`/`ich6`), when any.
    pub sound: Option<String>,
}

/// Whole GiB, rounded up.
fn gib_round_up(bytes: u64) -> u64 {
    bytes.div_ceil(1 << 30)
}

/// Builds the `<ovf:Envelope ovf:version="0.9">` document.
pub fn build_envelope(p: &OvfParams) -> Element {
    let created = Utc::now().format("%Y/%m/%d %H:%M:%S").to_string();

    let mut references = Element::new("References");
    for d in &p.disks {
        references.push(
            Element::new("File")
                .attr("ovf:href", &format!("{}/{}", d.image_uuid, d.vol_uuid))
                .attr("ovf:id", &d.vol_uuid.to_string())
                .attr("ovf:size", &d.virtual_size.to_string())
                .attr("ovf:description", &p.name),
        );
    }

    let mut disk_section = Element::new("Section")
        .attr("xsi:type", "ovf:DiskSection_Type");
    disk_section.push(Element::new("Info").text("List of Virtual Disks"));
    for d in &p.disks {
        let mut disk = Element::new("Disk")
            .attr("ovf:diskId", &d.vol_uuid.to_string())
            .attr("ovf:size", &gib_round_up(d.virtual_size).to_string());
        if let Some(actual) = d.actual_size {
            disk = disk.attr("ovf:actual_size", &gib_round_up(actual).to_string());
        } else {
            disk.push(Element::new("Comment").text("actual size unknown; estimate only"));
        }
        disk = disk
            .attr("ovf:fileRef", &format!("{}/{}", d.image_uuid, d.vol_uuid))
            .attr("ovf:parentRef", "")
            .attr("ovf:vm_snapshot_id", &p.vm_snapshot_id.to_string())
            .attr(
                "ovf:volume-format",
                if d.format == "COW" { "COW" } else { "RAW" },
            )
            .attr("ovf:format", "http://www.vmware.com/specifications/vmdk.html#sparse")
            .attr("ovf:disk-interface", "VirtIO")
            .attr("ovf:disk-type", "System")
            .attr("ovf:boot", if d.bootable { "True" } else { "False" });
        disk_section.push(disk);
    }

    let mut net_section = Element::new("Section").attr("xsi:type", "ovf:NetworkSection_Type");
    net_section.push(Element::new("Info").text("List of Networks"));
    for n in &p.nics {
        net_section.push(Element::new("Network").attr("ovf:name", &n.network));
    }

    let mut content = Element::new("Content")
        .attr("ovf:id", "out")
        .attr("xsi:type", "ovf:VirtualSystem_Type");
    content.push(Element::new("Name").text(&p.name));
    content.push(Element::new("TemplateId").text("00000000-0000-0000-0000-000000000000"));
    content.push(Element::new("TemplateName").text("Blank"));
    content.push(Element::new("Description").text("imported by vmlift"));
    content.push(Element::new("Domain"));
    content.push(Element::new("CreationDate").text(&created));
    content.push(Element::new("IsInitilized").text("True"));
    content.push(Element::new("IsAutoSuspend").text("False"));
    content.push(Element::new("TimeZone"));
    content.push(Element::new("IsStateless").text("False"));
    content.push(Element::new("VmType").text(if p.server { "1" } else { "0" }));
    content.push(Element::new("DefaultDisplayType").text("1"));
    if let Some(origin) = p.origin {
        content.push(Element::new("Origin").text(&origin.to_string()));
    }

    let mut os_section = Element::new("Section")
        .attr("ovf:id", &p.vm_uuid.to_string())
        .attr("ovf:required", "false")
        .attr("xsi:type", "ovf:OperatingSystemSection_Type");
    os_section.push(Element::new("Info").text("Guest Operating System"));
    os_section.push(Element::new("Description").text(&p.os_token));
    content.push(os_section);

    let mut hw = Element::new("Section").attr("xsi:type", "ovf:VirtualHardwareSection_Type");
    hw.push(Element::new("Info").text(&format!(
        "{} CPU, {} Memory",
        p.vcpus,
        p.memory / (1 << 20)
    )));

    let mut cpu = Element::new("Item");
    cpu.push(Element::new("rasd:Caption").text(&format!("{} virtual cpu", p.vcpus)));
    cpu.push(Element::new("rasd:Description").text("Number of virtual CPU"));
    cpu.push(Element::new("rasd:InstanceId").text("1"));
    cpu.push(Element::new("rasd:ResourceType").text(resource::CPU));
    cpu.push(Element::new("rasd:num_of_sockets").text(&p.vcpus.to_string()));
    cpu.push(Element::new("rasd:cpu_per_socket").text("1"));
    hw.push(cpu);

    let mem_mb = p.memory / (1 << 20);
    let mut mem = Element::new("Item");
    mem.push(Element::new("rasd:Caption").text(&format!("{mem_mb} MB of memory")));
    mem.push(Element::new("rasd:Description").text("Memory Size"));
    mem.push(Element::new("rasd:InstanceId").text("2"));
    mem.push(Element::new("rasd:ResourceType").text(resource::MEMORY));
    mem.push(Element::new("rasd:AllocationUnits").text("MegaBytes"));
    mem.push(Element::new("rasd:VirtualQuantity").text(&mem_mb.to_string()));
    hw.push(mem);

    let mut usb = Element::new("Item");
    usb.push(Element::new("rasd:Caption").text("USB Controller"));
    usb.push(Element::new("rasd:InstanceId").text("3"));
    usb.push(Element::new("rasd:ResourceType").text(resource::USB));
    usb.push(Element::new("rasd:UsbPolicy").text("Disabled"));
    hw.push(usb);

    let mut video = Element::new("Item");
    video.push(Element::new("rasd:Caption").text("Graphical Controller"));
    video.push(Element::new("rasd:InstanceId").text(&Uuid::new_v4().to_string()));
    video.push(Element::new("rasd:ResourceType").text(resource::VIDEO));
    video.push(Element::new("rasd:VirtualQuantity").text("1"));
    video.push(Element::new("rasd:Device").text("qxl"));
    hw.push(video);

    let mut instance = 4u32;
    for d in &p.disks {
        let mut item = Element::new("Item");
        item.push(Element::new("rasd:Caption").text("Drive 1"));
        item.push(Element::new("rasd:InstanceId").text(&d.vol_uuid.to_string()));
        item.push(Element::new("rasd:ResourceType").text(resource::DISK));
        item.push(
            Element::new("rasd:HostResource").text(&format!("{}/{}", d.image_uuid, d.vol_uuid)),
        );
        item.push(Element::new("rasd:Parent").text("00000000-0000-0000-0000-000000000000"));
        item.push(Element::new("rasd:Template").text("00000000-0000-0000-0000-000000000000"));
        item.push(Element::new("rasd:ApplicationList"));
        item.push(Element::new("rasd:StorageId").text(&p.sd_uuid.to_string()));
        item.push(Element::new("rasd:StoragePoolId").text("00000000-0000-0000-0000-000000000000"));
        item.push(Element::new("rasd:CreationDate").text(&created));
        item.push(Element::new("rasd:LastModified").text(&created));
        hw.push(item);
        instance += 1;
    }

    for n in &p.nics {
        let mut item = Element::new("Item");
        item.push(Element::new("rasd:Caption").text(&format!("Ethernet adapter on {}", n.network)));
        item.push(Element::new("rasd:InstanceId").text(&instance.to_string()));
        item.push(Element::new("rasd:ResourceType").text(resource::NIC));
        item.push(Element::new("rasd:ResourceSubType").text(&n.subtype));
        item.push(Element::new("rasd:Connection").text(&n.network));
        item.push(Element::new("rasd:Name").text(&n.dev));
        if let Some(mac) = &n.mac {
            item.push(Element::new("rasd:MACAddress").text(mac));
        }
        item.push(Element::new("rasd:speed").text("1000"));
        hw.push(item);
        instance += 1;
    }

    if let Some(sound) = &p.sound {
        let mut item = Element::new("Item");
        item.push(Element::new("rasd:Caption").text("Sound Card"));
        item.push(Element::new("rasd:InstanceId").text(&instance.to_string()));
        item.push(Element::new("rasd:ResourceType").text(resource::SOUND));
        item.push(Element::new("rasd:OtherResourceType").text(sound));
        item.push(Element::new("rasd:Device").text(sound));
        hw.push(item);
    }

    content.push(hw);

    Element::new("ovf:Envelope")
        .attr("xmlns:rasd", "http://schemas.dmtf.org/wbem/wscim/1/cim-schema/2/CIM_ResourceAllocationSettingData")
        .attr("xmlns:vssd", "http://schemas.dmtf.org/wbem/wscim/1/cim-schema/2/CIM_VirtualSystemSettingData")
        .attr("xmlns:xsi", "http://www.w3.org/2001/XMLSchema-instance")
        .attr("xmlns:ovf", "http://schemas.dmtf.org/ovf/envelope/1/")
        .attr("ovf:version", "0.9")
        .child(references)
        .child(disk_section)
        .child(net_section)
        .child(content)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn params() -> OvfParams {
        OvfParams {
            name: "win2016".into(),
            memory: 4 << 30,
            vcpus: 2,
            server: true,
            origin: Some(1),
            os_token: "windows_2016x64".into(),
            firmware_efi: false,
            sd_uuid: Uuid::new_v4(),
            vm_uuid: Uuid::new_v4(),
            vm_snapshot_id: Uuid::new_v4(),
            disks: vec![OvfDiskOut {
                image_uuid: Uuid::new_v4(),
                vol_uuid: Uuid::new_v4(),
                virtual_size: 40 << 30,
                actual_size: Some(13 << 30),
                format: "RAW".into(),
                bootable: true,
            }],
            nics: vec![OvfNicOut {
                dev: "eth0".into(),
                subtype: "3".into(),
                network: "ovirtmgmt".into(),
                mac: Some("52:54:00:01:02:03".into()),
            }],
            sound: Some("ac97".into()),
        }
    }

    #[test]
    fn envelope_round_trips_through_the_parser() {
        let p = params();
        let envelope = build_envelope(&p);
        let parsed = parse_ovf(&envelope).unwrap();

        assert_eq!(parsed.name, "win2016");
        assert_eq!(parsed.memory_mb, 4096);
        assert_eq!(parsed.vcpus, 2);
        assert_eq!(parsed.vm_type_server, Some(true));
        assert_eq!(parsed.origin, Some(1));
        assert_eq!(parsed.os_description.as_deref(), Some("windows_2016x64"));
        assert_eq!(parsed.disks.len(), 1);
        assert_eq!(parsed.nics.len(), 1);
        assert_eq!(parsed.nics[0].network, "ovirtmgmt");
        assert_eq!(parsed.nics[0].subtype.as_deref(), Some("3"));
        assert_eq!(parsed.sound.as_deref(), Some("ac97"));
    }

    #[test]
    fn disk_sizes_are_whole_gib_rounded_up() {
        assert_eq!(gib_round_up(1), 1);
        assert_eq!(gib_round_up(1 << 30), 1);
        assert_eq!(gib_round_up((1 << 30) + 1), 2);
        let envelope = build_envelope(&params());
        let section = envelope
            .children
            .iter()
            .find(|c| c.attr_value("xsi:type") == Some("ovf:DiskSection_Type"))
            .unwrap();
        let disk = section.find("Disk").unwrap();
        assert_eq!(disk.attr_value("ovf:size"), Some("40"));
        assert_eq!(disk.attr_value("ovf:actual_size"), Some("13"));
    }

    #[test]
    fn missing_actual_size_emits_comment() {
        let mut p = params();
        p.disks[0].actual_size = None;
        let envelope = build_envelope(&p);
        let section = envelope
            .children
            .iter()
            .find(|c| c.attr_value("xsi:type") == Some("ovf:DiskSection_Type"))
            .unwrap();
        let disk = section.find("Disk").unwrap();
        assert!(disk.attr_value("ovf:actual_size").is_none());
        assert!(disk.find("Comment").is_some());
    }

    #[test]
    fn parses_vmware_flavour() {
        let xml = r#"
          <Envelope xmlns="http://schemas.dmtf.org/ovf/envelope/1"
                    xmlns:ovf="http://schemas.dmtf.org/ovf/envelope/1"
                    xmlns:rasd="http://schemas.dmtf.org/wbem/wscim/1/cim-schema/2/CIM_ResourceAllocationSettingData">
            <References>
              <File ovf:href="disk1.vmdk" ovf:id="file1"/>
              <File ovf:href="disk2.vmdk" ovf:id="file2"/>
            </References>
            <DiskSection>
              <Info>disks</Info>
              <Disk ovf:capacity="10" ovf:capacityAllocationUnits="byte * 2^20"
                    ovf:diskId="vmdisk1" ovf:fileRef="file1"
                    ovf:format="http://www.vmware.com/interfaces/specifications/vmdk.html#streamOptimized"/>
              <Disk ovf:capacity="20" ovf:capacityAllocationUnits="byte * 2^20"
                    ovf:diskId="vmdisk2" ovf:fileRef="file2"/>
            </DiskSection>
            <VirtualSystem ovf:id="twodisks">
              <Name>twodisks</Name>
              <VirtualHardwareSection>
                <Item><rasd:ResourceType>3</rasd:ResourceType><rasd:VirtualQuantity>1</rasd:VirtualQuantity></Item>
                <Item><rasd:ResourceType>4</rasd:ResourceType><rasd:VirtualQuantity>1024</rasd:VirtualQuantity></Item>
                <Item><rasd:ResourceType>17</rasd:ResourceType><rasd:HostResource>ovf:/disk/vmdisk1</rasd:HostResource></Item>
                <Item><rasd:ResourceType>17</rasd:ResourceType><rasd:HostResource>ovf:/disk/vmdisk2</rasd:HostResource></Item>
                <Item><rasd:ResourceType>10</rasd:ResourceType><rasd:ResourceSubType>E1000</rasd:ResourceSubType><rasd:Connection>VM Network</rasd:Connection></Item>
                <Item><rasd:ResourceType>15</rasd:ResourceType></Item>
              </VirtualHardwareSection>
            </VirtualSystem>
          </Envelope>"#;
        let parsed = parse_ovf(&Element::parse(xml).unwrap()).unwrap();

        assert_eq!(parsed.name, "twodisks");
        assert_eq!(parsed.memory_mb, 1024);
        // Two disks, input order preserved, hrefs resolved.
        assert_eq!(parsed.disks.len(), 2);
        assert_eq!(parsed.disks[0].href.as_deref(), Some("disk1.vmdk"));
        assert_eq!(parsed.disks[0].capacity, 10 << 20);
        assert_eq!(parsed.disks[1].href.as_deref(), Some("disk2.vmdk"));
        assert_eq!(parsed.disks[1].capacity, 20 << 20);
        assert_eq!(parsed.nics[0].subtype.as_deref(), Some("E1000"));
        assert_eq!(parsed.cdroms, 1);
    }
}
