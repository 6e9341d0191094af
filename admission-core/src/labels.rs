//! Well-known system label names attached to operations, exposed as
//! constants so host code never hardcodes the label strings.

pub const USER_AGENT: &str = "servicecontrol.googleapis.com/user_agent";
pub const SERVICE_AGENT: &str = "servicecontrol.googleapis.com/service_agent";
pub const CALLER_IP: &str = "servicecontrol.googleapis.com/caller_ip";
pub const REFERER: &str = "servicecontrol.googleapis.com/referer";
pub const ANDROID_PACKAGE_NAME: &str = "servicecontrol.googleapis.com/android_package_name";
pub const ANDROID_CERT_FINGERPRINT: &str =
    "servicecontrol.googleapis.com/android_cert_fingerprint";
pub const IOS_BUNDLE_ID: &str = "servicecontrol.googleapis.com/ios_bundle_id";

pub const ALL: &[&str] = &[
    USER_AGENT,
    SERVICE_AGENT,
    CALLER_IP,
    REFERER,
    ANDROID_PACKAGE_NAME,
    ANDROID_CERT_FINGERPRINT,
    IOS_BUNDLE_ID,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_contains_every_constant() {
        assert_eq!(ALL.len(), 7);
        assert!(ALL.contains(&USER_AGENT));
        assert!(ALL.contains(&IOS_BUNDLE_ID));
    }
}
