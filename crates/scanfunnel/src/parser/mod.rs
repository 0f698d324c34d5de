pub mod gmp;
pub mod nmap;
pub mod nuclei;

pub use nmap::parse_nmap_xml;
pub use nuclei::parse_nuclei_jsonl;
