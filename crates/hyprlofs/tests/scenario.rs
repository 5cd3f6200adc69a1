// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! End-to-end administration of a simulated hyprlofs mount through the async
//! API.

use std::sync::Arc;

use hyprlofs::{Error, Filesystem, HyprlofsConfig, Mapping, SimulatedPlatform};
use nix::errno::Errno;
use serde_json::json;

fn filesystem() -> (Arc<SimulatedPlatform>, Filesystem<SimulatedPlatform>) {
    let sim = Arc::new(SimulatedPlatform::new());
    sim.create_dir("/vfs");
    let fs = Filesystem::with_platform(Arc::clone(&sim), "/vfs", HyprlofsConfig::default());
    (sim, fs)
}

#[tokio::test]
async fn mount_edit_list_unmount_and_reopen() -> Result<(), Error> {
    let (sim, fs) = filesystem();

    fs.mount()?.await?;
    fs.add_mappings([("/etc/hosts", "hosts"), ("/etc/passwd", "pw")])?
        .await?;
    assert_eq!(
        fs.list_mappings()?.await?,
        vec![
            Mapping::new("/etc/hosts", "hosts"),
            Mapping::new("/etc/passwd", "pw")
        ]
    );

    fs.remove_mappings(["hosts"])?.await?;
    assert_eq!(
        fs.list_mappings()?.await?,
        vec![Mapping::new("/etc/passwd", "pw")]
    );

    // The descriptor cached by the listings is closed before umount, which the
    // simulated kernel would otherwise refuse with EBUSY.
    fs.unmount()?.await?;
    assert!(!sim.is_mounted("/vfs"));
    let opens_before = sim.opens("/vfs");

    fs.mount()?.await?;
    assert!(fs.list_mappings()?.await?.is_empty());
    assert_eq!(sim.opens("/vfs"), opens_before + 1);
    Ok(())
}

#[tokio::test]
async fn remove_all_leaves_an_empty_table() -> Result<(), Error> {
    let (_sim, fs) = filesystem();
    fs.mount()?.await?;
    fs.add_mappings_value(&json!([["/a", "a"], ["/b", "b"], ["/c", "c"]]))?
        .await?;
    fs.remove_all()?.await?;
    assert!(fs.list_mappings()?.await?.is_empty());

    // Clearing an empty table is not an error.
    fs.remove_all()?.await?;
    assert!(fs.list_mappings()?.await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn listing_matches_added_set_and_is_stable() -> Result<(), Error> {
    let (_sim, fs) = filesystem();
    fs.mount()?.await?;

    let pairs: Vec<(String, String)> = (0..40)
        .map(|i| (format!("/srv/data/file{i}"), format!("f{i:02}")))
        .collect();
    fs.add_mappings(pairs.iter().map(|(p, n)| (p.as_str(), n.as_str())))?
        .await?;

    let first = fs.list_mappings()?.await?;
    let second = fs.list_mappings()?.await?;
    assert_eq!(first, second);

    let mut listed: Vec<(String, String)> =
        first.into_iter().map(|m| (m.path, m.name)).collect();
    let mut expected = pairs;
    listed.sort();
    expected.sort();
    assert_eq!(listed, expected);
    Ok(())
}

#[tokio::test]
async fn busy_rejection_does_not_disturb_pending_operation() -> Result<(), Error> {
    let (sim, fs) = filesystem();
    fs.mount()?.await?;

    let adding = fs.add_mappings([("/etc/hosts", "hosts")])?;
    let rejected = fs.remove_all().unwrap_err();
    assert!(matches!(rejected, Error::Busy { op: "removeAll" }));
    let rejected = fs.add_mappings([("/etc/passwd", "pw")]).unwrap_err();
    assert!(matches!(rejected, Error::Busy { op: "addMappings" }));

    adding.await?;
    assert_eq!(sim.entries("/vfs"), vec![Mapping::new("/etc/hosts", "hosts")]);
    Ok(())
}

#[tokio::test]
async fn duplicate_names_fail_through_completion() -> Result<(), Error> {
    let (_sim, fs) = filesystem();
    fs.mount()?.await?;
    fs.add_mappings([("/etc/hosts", "hosts")])?.await?;

    let err = fs.add_mappings([("/etc/hosts", "hosts")])?.await.unwrap_err();
    assert_eq!(err.errno(), Some(Errno::EEXIST));
    assert!(err.to_string().starts_with("hyprlofs ioctl ADD '/vfs': "));
    assert!(!fs.is_pending());
    Ok(())
}

#[tokio::test]
async fn remount_underneath_is_recovered_on_the_following_call() -> Result<(), Error> {
    let (sim, fs) = filesystem();
    fs.mount()?.await?;
    fs.add_mappings([("/etc/hosts", "hosts")])?.await?;

    sim.force_remount("/vfs");
    let err = fs.list_mappings()?.await.unwrap_err();
    assert_eq!(err.errno(), Some(Errno::ENOTTY));

    assert!(fs.list_mappings()?.await?.is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn independent_mountpoints_run_concurrently() -> Result<(), Error> {
    let sim = Arc::new(SimulatedPlatform::new());
    sim.create_dir("/a");
    sim.create_dir("/b");
    let a = Filesystem::with_platform(Arc::clone(&sim), "/a", HyprlofsConfig::default());
    let b = Filesystem::with_platform(Arc::clone(&sim), "/b", HyprlofsConfig::default());

    let (ra, rb) = tokio::join!(a.mount()?, b.mount()?);
    ra?;
    rb?;
    let (ra, rb) = tokio::join!(
        a.add_mappings([("/etc/hosts", "hosts")])?,
        b.add_mappings([("/etc/passwd", "pw")])?
    );
    ra?;
    rb?;

    assert_eq!(a.list_mappings()?.await?, vec![Mapping::new("/etc/hosts", "hosts")]);
    assert_eq!(b.list_mappings()?.await?, vec![Mapping::new("/etc/passwd", "pw")]);
    Ok(())
}
