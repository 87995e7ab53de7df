//! Shared fixtures for the integration tests: daemons with volumes backed
//! by temporary directories.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use zlomekfs::config::LocalConfig;
use zlomekfs::daemon::Zfsd;
use zlomekfs::fh::Sattr;

/// A daemon named `n<sid>` with one local volume `vid` cached under
/// `cache`. The volume is mounted at `/m<vid>` and mastered locally.
pub fn master_daemon(sid: u32, vid: u32, cache: &Path) -> Arc<Zfsd> {
    let config = LocalConfig::parse(&format!(
        r#"
        [local_node]
        id = {sid}
        name = "n{sid}"
        port = 0

        [[volumes]]
        id = {vid}
        cache_size = 0
        local_path = "{}"
        "#,
        cache.display()
    ))
    .expect("fixture config parses");
    let zfsd = Zfsd::new(config).expect("daemon builds");

    let volume = zfsd.volumes.lock().lookup(vid).unwrap();
    volume.set_common_info(
        &format!("vol{vid}"),
        &format!("/m{vid}"),
        sid,
        sid,
        BTreeSet::new(),
    );
    zfsd.mount_known_volumes();
    zfsd
}

/// Attribute template used by creation calls in the scenarios.
pub fn mode(bits: u32) -> Sattr {
    Sattr { mode: Some(bits), ..Default::default() }
}

/// `O_*` creation flags as the wire carries them.
pub fn rw_create_flags() -> u32 {
    (libc::O_RDWR | libc::O_CREAT) as u32
}
