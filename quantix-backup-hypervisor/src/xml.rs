//! Libvirt domain XML inspection.
//!
//! Extracts the attached disk targets from a domain definition. Only
//! host-path sources (`file=` and `dev=`) are reported; network volumes and
//! pool-backed volumes have no path the host can archive directly.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::error::{HypervisorError, Result};
use crate::types::{BlockTarget, DiskDevice};

/// Parse all `<devices><disk>` elements from a domain XML document.
pub fn parse_block_targets(xml: &str) -> Result<Vec<BlockTarget>> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);
    
    let mut targets = Vec::new();
    let mut current: Option<BlockTarget> = None;
    
    loop {
        let event = reader.read_event()
            .map_err(|e| HypervisorError::XmlError(format!(
                "at byte {}: {}", reader.buffer_position(), e
            )))?;
        
        match event {
            Event::Start(ref e) if e.name().as_ref() == b"disk" => {
                current = Some(BlockTarget {
                    target: String::new(),
                    device: DiskDevice::from_attr(&attr(e, b"device")?.unwrap_or_default()),
                    source: None,
                });
            }
            Event::Start(ref e) | Event::Empty(ref e) => {
                let Some(disk) = current.as_mut() else {
                    continue;
                };
                match e.name().as_ref() {
                    b"source" => {
                        // Backing chains nest further <source> elements; the
                        // first one belongs to the disk itself.
                        if disk.source.is_none() {
                            disk.source = match attr(e, b"file")? {
                                Some(file) => Some(file),
                                None => attr(e, b"dev")?,
                            };
                        }
                    }
                    b"target" => {
                        if let Some(dev) = attr(e, b"dev")? {
                            disk.target = dev;
                        }
                    }
                    _ => {}
                }
            }
            Event::End(ref e) if e.name().as_ref() == b"disk" => {
                if let Some(disk) = current.take() {
                    targets.push(disk);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    
    Ok(targets)
}

/// Read and unescape a single attribute.
fn attr(element: &BytesStart<'_>, name: &[u8]) -> Result<Option<String>> {
    for attribute in element.attributes() {
        let attribute = attribute
            .map_err(|e| HypervisorError::XmlError(e.to_string()))?;
        if attribute.key.as_ref() == name {
            let value = attribute.unescape_value()
                .map_err(|e| HypervisorError::XmlError(e.to_string()))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOMAIN_XML: &str = r#"<domain type='kvm'>
  <name>db1</name>
  <uuid>4dea22b3-1d52-d8f3-2516-782e98ab3fa0</uuid>
  <devices>
    <emulator>/usr/bin/qemu-system-x86_64</emulator>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2' cache='none'/>
      <source file='/var/lib/libvirt/images/db1.qcow2'/>
      <backingStore type='file'>
        <format type='qcow2'/>
        <source file='/var/lib/libvirt/images/base.qcow2'/>
      </backingStore>
      <target dev='vda' bus='virtio'/>
    </disk>
    <disk type='block' device='disk'>
      <driver name='qemu' type='raw' cache='none' io='native'/>
      <source dev='/dev/disk/by-id/ata-WDC_WD40EFRX-68N32N0_WD-WCC7K0'/>
      <target dev='sdb' bus='sata'/>
    </disk>
    <disk type='file' device='cdrom'>
      <driver name='qemu' type='raw'/>
      <target dev='sdc' bus='sata'/>
      <readonly/>
    </disk>
    <disk type='network' device='disk'>
      <source protocol='rbd' name='pool/image'>
        <host name='10.0.0.5' port='6789'/>
      </source>
      <target dev='vdb' bus='virtio'/>
    </disk>
    <interface type='bridge'>
      <source bridge='br0'/>
    </interface>
  </devices>
</domain>"#;

    #[test]
    fn test_parse_file_and_block_sources() {
        let targets = parse_block_targets(DOMAIN_XML).unwrap();
        assert_eq!(targets.len(), 4);
        
        assert_eq!(targets[0].target, "vda");
        assert_eq!(targets[0].source.as_deref(), Some("/var/lib/libvirt/images/db1.qcow2"));
        
        assert_eq!(targets[1].target, "sdb");
        assert_eq!(
            targets[1].source.as_deref(),
            Some("/dev/disk/by-id/ata-WDC_WD40EFRX-68N32N0_WD-WCC7K0")
        );
    }

    #[test]
    fn test_sourceless_disks_have_no_source() {
        let targets = parse_block_targets(DOMAIN_XML).unwrap();
        
        assert_eq!(targets[2].device, DiskDevice::Cdrom);
        assert!(targets[2].source.is_none());
        
        // Network disk has a <source> but neither file= nor dev=
        assert_eq!(targets[3].target, "vdb");
        assert!(targets[3].source.is_none());
    }

    #[test]
    fn test_interface_source_is_ignored() {
        let targets = parse_block_targets(DOMAIN_XML).unwrap();
        assert!(targets.iter().all(|t| t.source.as_deref() != Some("br0")));
    }

    #[test]
    fn test_escaped_paths_are_unescaped() {
        let xml = "<domain><devices><disk type='file' device='disk'>\
            <source file='/images/a&amp;b.img'/><target dev='vda'/>\
            </disk></devices></domain>";
        let targets = parse_block_targets(xml).unwrap();
        assert_eq!(targets[0].source.as_deref(), Some("/images/a&b.img"));
    }

    #[test]
    fn test_malformed_xml_is_an_error() {
        let result = parse_block_targets("<domain><devices><disk></devices>");
        assert!(matches!(result, Err(HypervisorError::XmlError(_))));
    }
}
