//! Copyright, warranty and license texts printed by the CLI.

use reqwest::Client;
use tracing::warn;

use crate::errors::{LicenseError, LicenseResult};

pub const GPL_TEXT_URL: &str = "https://www.gnu.org/licenses/gpl-3.0.txt";
pub const GPL_INFO_URL: &str = "https://www.gnu.org/licenses/gpl-3.0";

const END_OF_TERMS: &str = "END OF TERMS AND CONDITIONS";

pub const COPYRIGHT_TEXT: &str = concat!(
    "vGPU License Monitor ",
    env!("CARGO_PKG_VERSION"),
    "\n",
    "This program comes with ABSOLUTELY NO WARRANTY; for details run `licmon warranty'.\n",
    "This is free software, and you are welcome to redistribute it under certain conditions; ",
    "run `licmon license' for details.\n",
);

pub const WARRANTY_TEXT: &str = "This program is distributed in the hope that it will be useful, \
but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A \
PARTICULAR PURPOSE. See the GNU General Public License for more details.";

/// The terms section of the GPL text, without the appendix.
pub fn license_terms(full_text: &str) -> Option<&str> {
    full_text
        .find(END_OF_TERMS)
        .map(|end| &full_text[..end])
}

/// Download the GPL text and cut it at the end of the terms.
pub async fn fetch_license_terms(url: &str) -> LicenseResult<String> {
    let resp = Client::new().get(url).send().await?;
    if !resp.status().is_success() {
        return Err(LicenseError::ServerError(format!(
            "license text request failed with HTTP status {}",
            resp.status()
        )));
    }
    let text = resp.text().await?;
    license_terms(&text)
        .map(str::to_string)
        .ok_or_else(|| LicenseError::ServerError("license text has no end of terms".to_string()))
}

/// Print the GPL terms, or where to find them if they cannot be fetched.
pub async fn print_license_terms() {
    match fetch_license_terms(GPL_TEXT_URL).await {
        Ok(terms) => println!("{terms}"),
        Err(e) => {
            warn!(error = %e, "Failed to fetch the GPLv3 license text");
            println!("To view the license please visit {GPL_INFO_URL}");
        }
    }
}
