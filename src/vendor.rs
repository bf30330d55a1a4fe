//! TLB descriptors decoded from the processor's identification leaves.
//!
//! Independent of the latency engine: this only produces text for the `tlb-info` tool.
use log::debug;
use raw_cpuid::{CacheInfoType, CpuId};

/// Human-readable TLB description of the running processor, one line per entry.
///
/// Leaves the processor doesn't implement are skipped; Intel parts answer leaf 2 and 0x18,
/// AMD parts answer 0x80000005 and 0x80000006.
pub fn tlb_report() -> Vec<String> {
    let cpuid = CpuId::new();
    let mut lines = Vec::new();

    match cpuid.get_vendor_info() {
        Some(vendor) => lines.push(format!("Vendor: {}", vendor.as_str())),
        None => lines.push("Vendor: unknown".to_string()),
    }

    if let Some(descriptors) = cpuid.get_cache_info() {
        let tlbs: Vec<_> = descriptors
            .filter(|info| {
                matches!(
                    info.typ,
                    CacheInfoType::TLB | CacheInfoType::STLB | CacheInfoType::DTLB
                )
            })
            .collect();
        if !tlbs.is_empty() {
            lines.push("Leaf 0x2 descriptors:".to_string());
        }
        for info in tlbs {
            lines.push(format!("  0x{:02x}: {}", info.num, info.desc()));
        }
    } else {
        debug!("leaf 0x2 not available");
    }

    if let Some(entries) = cpuid.get_deterministic_address_translation_info() {
        let mut header = false;
        for dat in entries {
            if !header {
                lines.push("Leaf 0x18 address translation:".to_string());
                header = true;
            }
            let mut pages = Vec::new();
            if dat.has_4k_entries() {
                pages.push("4K");
            }
            if dat.has_2mb_entries() {
                pages.push("2M");
            }
            if dat.has_4mb_entries() {
                pages.push("4M");
            }
            if dat.has_1gb_entries() {
                pages.push("1G");
            }
            let layout = if dat.is_fully_associative() {
                format!("{} entries, fully associative", dat.sets())
            } else {
                format!("{} ways x {} sets", dat.ways(), dat.sets())
            };
            lines.push(format!(
                "  L{} {:?} [{}]: {layout}",
                dat.cache_level(),
                dat.cache_type(),
                pages.join("/")
            ));
        }
    }

    if let Some(l1) = cpuid.get_l1_cache_and_tlb_info() {
        lines.push("L1 TLB (0x80000005):".to_string());
        lines.push(format!(
            "  dTLB 4K: {} entries, {:?}",
            l1.dtlb_4k_size(),
            l1.dtlb_4k_associativity()
        ));
        lines.push(format!(
            "  iTLB 4K: {} entries, {:?}",
            l1.itlb_4k_size(),
            l1.itlb_4k_associativity()
        ));
        lines.push(format!(
            "  dTLB 2M/4M: {} entries, {:?}",
            l1.dtlb_2m_4m_size(),
            l1.dtlb_2m_4m_associativity()
        ));
        lines.push(format!(
            "  iTLB 2M/4M: {} entries, {:?}",
            l1.itlb_2m_4m_size(),
            l1.itlb_2m_4m_associativity()
        ));
    }

    if let Some(l2) = cpuid.get_l2_l3_cache_and_tlb_info() {
        lines.push("L2 TLB (0x80000006):".to_string());
        lines.push(format!(
            "  dTLB 4K: {} entries, {:?}",
            l2.dtlb_4k_size(),
            l2.dtlb_4k_associativity()
        ));
        lines.push(format!(
            "  iTLB 4K: {} entries, {:?}",
            l2.itlb_4k_size(),
            l2.itlb_4k_associativity()
        ));
    }

    lines
}
