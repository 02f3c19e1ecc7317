//! Decodes the `nvidia-smi -q -x` report into a [`LicenseStatus`].
//!
//! Only `nvidia_smi_log/gpu/vgpu_software_licensed_product` is read; every
//! other element in the report is ignored. Malformed or empty reports decode
//! to an empty status rather than an error.

use serde::Deserialize;
use tracing::{debug, warn};

use crate::diagnostics::DiagnosticOutput;

/// License state reported by the diagnostic tool for the first GPU.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LicenseStatus {
    /// Free-form status, e.g. `Licensed (Expiry: 2024-01-01 00:00:00 GMT)`.
    pub status_text: String,
    /// Licensed product, e.g. `NVIDIA RTX Virtual Workstation`.
    pub product_name: String,
}

impl LicenseStatus {
    pub fn new(status_text: impl Into<String>) -> Self {
        Self {
            status_text: status_text.into(),
            product_name: String::new(),
        }
    }

    /// Status used when the report could not be decoded.
    pub fn unknown() -> Self {
        Self::default()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SmiLog {
    gpu: Vec<Gpu>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Gpu {
    vgpu_software_licensed_product: LicensedProduct,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LicensedProduct {
    licensed_product_name: String,
    license_status: String,
}

/// Decode a diagnostic report.
pub fn parse(output: &DiagnosticOutput) -> LicenseStatus {
    parse_str(output.as_str())
}

/// Decode report text. See [`parse`].
pub fn parse_str(xml: &str) -> LicenseStatus {
    if xml.trim().is_empty() {
        debug!("Diagnostic output is empty");
        return LicenseStatus::unknown();
    }

    let log: SmiLog = match quick_xml::de::from_str(xml) {
        Ok(log) => log,
        Err(e) => {
            warn!(error = %e, "Failed to decode diagnostic output");
            return LicenseStatus::unknown();
        }
    };

    match log.gpu.into_iter().next() {
        Some(gpu) => {
            let product = gpu.vgpu_software_licensed_product;
            LicenseStatus {
                status_text: product.license_status.trim().to_string(),
                product_name: product.licensed_product_name.trim().to_string(),
            }
        }
        None => {
            warn!("Diagnostic output lists no GPU");
            LicenseStatus::unknown()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LICENSED_REPORT: &str = r#"<?xml version="1.0" ?>
<!DOCTYPE nvidia_smi_log SYSTEM "nvsmi_device_v12.dtd">
<nvidia_smi_log>
	<timestamp>Mon Jun  5 10:12:44 2023</timestamp>
	<driver_version>528.89</driver_version>
	<attached_gpus>1</attached_gpus>
	<gpu id="00000000:02:01.0">
		<product_name>NVIDIA A16-4Q</product_name>
		<vgpu_software_licensed_product>
			<licensed_product_name>NVIDIA RTX Virtual Workstation</licensed_product_name>
			<license_status>Licensed (Expiry: 2023-06-01 12:00:00 GMT)</license_status>
		</vgpu_software_licensed_product>
		<fan_speed>N/A</fan_speed>
	</gpu>
</nvidia_smi_log>
"#;

    #[test]
    fn extracts_license_status_and_product() {
        let status = parse_str(LICENSED_REPORT);
        assert_eq!(
            status.status_text,
            "Licensed (Expiry: 2023-06-01 12:00:00 GMT)"
        );
        assert_eq!(status.product_name, "NVIDIA RTX Virtual Workstation");
    }

    #[test]
    fn reads_unlicensed_status() {
        let xml = LICENSED_REPORT.replace(
            "Licensed (Expiry: 2023-06-01 12:00:00 GMT)",
            "Unlicensed (Unrestricted)",
        );
        assert_eq!(parse_str(&xml).status_text, "Unlicensed (Unrestricted)");
    }

    #[test]
    fn empty_output_yields_empty_status() {
        assert_eq!(parse_str(""), LicenseStatus::unknown());
        assert_eq!(parse(&DiagnosticOutput::default()).status_text, "");
    }

    #[test]
    fn malformed_output_yields_empty_status() {
        assert_eq!(parse_str("<nvidia_smi_log><gpu>").status_text, "");
        assert_eq!(parse_str("NVIDIA-SMI has failed").status_text, "");
    }

    #[test]
    fn report_without_licensed_product_yields_empty_status() {
        let xml = r#"<nvidia_smi_log><gpu id="0"><product_name>Tesla T4</product_name></gpu></nvidia_smi_log>"#;
        assert_eq!(parse_str(xml).status_text, "");

        let xml = "<nvidia_smi_log><attached_gpus>0</attached_gpus></nvidia_smi_log>";
        assert_eq!(parse_str(xml).status_text, "");
    }

    #[test]
    fn first_gpu_wins() {
        let xml = r#"<nvidia_smi_log>
            <gpu id="0"><vgpu_software_licensed_product><license_status>Unlicensed</license_status></vgpu_software_licensed_product></gpu>
            <gpu id="1"><vgpu_software_licensed_product><license_status>Licensed (Expiry: 2030-01-01 00:00:00 GMT)</license_status></vgpu_software_licensed_product></gpu>
        </nvidia_smi_log>"#;
        assert_eq!(parse_str(xml).status_text, "Unlicensed");
    }
}
