//! Name derivation for LVs, subvolumes and engine devices.

/// LV name for a mountpoint: `/` is `rootlv`, `/var/log` is `var_loglv`.
pub fn lv_name(mountpoint: &str) -> String {
    if mountpoint == "/" {
        return "rootlv".to_string();
    }
    format!("{}lv", mountpoint.trim_start_matches('/').replace('/', "_"))
}

/// Btrfs subvolume name for a mountpoint: `/` is `root`.
pub fn subvolume_name(mountpoint: &str) -> String {
    if mountpoint == "/" {
        return "root".to_string();
    }
    mountpoint.trim_start_matches('/').replace('/', "_")
}

/// Append `00`, `01`, ... to `base` until `taken` rejects no more.
pub fn unique_name(base: &str, taken: impl Fn(&str) -> bool) -> String {
    if !taken(base) {
        return base.to_string();
    }
    (0..)
        .map(|i| format!("{base}{i:02}"))
        .find(|candidate| !taken(candidate))
        .unwrap_or_else(|| base.to_string())
}

/// systemd style path escaping: `/` becomes `-`, `/boot/efi` becomes
/// `boot-efi`, and bytes outside `[A-Za-z0-9:_.]` are hex escaped.
pub fn path_escape(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return "-".to_string();
    }
    let mut out = String::with_capacity(trimmed.len());
    for (i, b) in trimmed.bytes().enumerate() {
        match b {
            b'/' => out.push('-'),
            b'.' if i == 0 => out.push_str("\\x2e"),
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b':' | b'_' | b'.' => out.push(b as char),
            other => out.push_str(&format!("\\x{other:02x}")),
        }
    }
    out
}

/// First four characters of a UUID, used to keep device names short.
pub fn short_uuid(uuid: &str) -> &str {
    uuid.get(..4).unwrap_or(uuid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lv_names() {
        assert_eq!(lv_name("/"), "rootlv");
        assert_eq!(lv_name("/var/log"), "var_loglv");
        assert_eq!(lv_name("/home"), "homelv");
    }

    #[test]
    fn subvolume_names() {
        assert_eq!(subvolume_name("/"), "root");
        assert_eq!(subvolume_name("/var/log"), "var_log");
    }

    #[test]
    fn unique_names_skip_taken() {
        let taken = ["homelv", "homelv00"];
        assert_eq!(unique_name("homelv", |n| taken.contains(&n)), "homelv01");
        assert_eq!(unique_name("varlv", |n| taken.contains(&n)), "varlv");
    }

    #[test]
    fn path_escaping() {
        assert_eq!(path_escape("/"), "-");
        assert_eq!(path_escape("/boot/efi"), "boot-efi");
        assert_eq!(path_escape("/var/my-data"), "var-my\\x2ddata");
        assert_eq!(path_escape("/.hidden"), "\\x2ehidden");
    }
}
