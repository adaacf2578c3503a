use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;

use anyhow::Result;
use layerstore::archive::{Archive, ArchiveProvider, TarArchiveProvider, TarLayerArchive, ZipArchiveProvider, ZipLayerArchive};
use layerstore::fs::StoreError;
use layerstore::storage::Item;
use tempfile::TempDir;

fn populate(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir.join("a/b"))?;
    fs::create_dir_all(dir.join("empty"))?;
    fs::write(dir.join("top.txt"), b"top")?;
    fs::write(dir.join("a/one.txt"), b"one")?;
    fs::write(dir.join("a/b/two.txt"), b"two")?;
    Ok(())
}

fn read_all(archive: &dyn Archive, path: &str) -> Result<String> {
    let mut content = String::new();
    archive.read_file(path)?.read_to_string(&mut content)?;
    Ok(content)
}

fn sorted_items(archive: &dyn Archive) -> Result<Vec<Item>> {
    let mut items = archive.list_all_items()?.collect::<Result<Vec<_>, _>>()?;
    items.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(items)
}

fn expected_items() -> Vec<Item> {
    vec![
        Item::root(),
        Item::directory("a"),
        Item::directory("a/b"),
        Item::file("a/b/two.txt"),
        Item::file("a/one.txt"),
        Item::directory("empty"),
        Item::file("top.txt"),
    ]
}

fn check_round_trip(archive: &dyn Archive, dir: &TempDir) -> Result<()> {
    let staging = dir.path().join("staging");
    populate(&staging)?;
    assert!(!archive.is_archived());

    archive.archive_from(&staging)?;
    assert!(archive.is_archived());

    assert_eq!(read_all(archive, "a/b/two.txt")?, "two");
    assert!(archive.file_exists("top.txt")?);
    assert!(archive.file_exists("empty")?);
    assert!(!archive.file_exists("missing.txt")?);
    assert!(matches!(archive.read_file("missing.txt"), Err(StoreError::NotFound(_))));

    let first = archive.list_all_items()?.next().transpose()?;
    assert_eq!(first, Some(Item::root()));
    assert_eq!(sorted_items(archive)?, expected_items());

    let restored = dir.path().join("restored");
    archive.unarchive_to(&restored)?;
    assert!(restored.join("empty").is_dir());
    assert_eq!(fs::read_to_string(restored.join("a/one.txt"))?, "one");
    assert_eq!(fs::read_to_string(restored.join("top.txt"))?, "top");
    Ok(())
}

#[test]
fn test_zip_round_trip() -> Result<()> {
    let dir = TempDir::new()?;
    let archive = ZipLayerArchive::new(dir.path().join("layer.zip"));
    check_round_trip(&archive, &dir)
}

#[test]
fn test_tar_round_trip() -> Result<()> {
    let dir = TempDir::new()?;
    let archive = TarLayerArchive::new(dir.path().join("layer.tar"));
    check_round_trip(&archive, &dir)
}

#[test]
fn test_empty_staging_dir_lists_only_root() -> Result<()> {
    let dir = TempDir::new()?;
    let staging = dir.path().join("staging");
    fs::create_dir(&staging)?;

    let zip = ZipLayerArchive::new(dir.path().join("layer.zip"));
    zip.archive_from(&staging)?;
    assert_eq!(sorted_items(&zip)?, vec![Item::root()]);

    let tar = TarLayerArchive::new(dir.path().join("layer.tar"));
    tar.archive_from(&staging)?;
    assert_eq!(sorted_items(&tar)?, vec![Item::root()]);
    Ok(())
}

#[test]
fn test_existing_archive_is_detected() -> Result<()> {
    let dir = TempDir::new()?;
    let staging = dir.path().join("staging");
    populate(&staging)?;
    ZipLayerArchive::new(dir.path().join("layer.zip")).archive_from(&staging)?;

    let reopened = ZipLayerArchive::new(dir.path().join("layer.zip"));
    assert!(reopened.is_archived());
    assert_eq!(read_all(&reopened, "a/one.txt")?, "one");
    Ok(())
}

#[test]
fn test_zip_entry_outside_target_extracts_nothing() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("evil.zip");
    {
        let mut writer = zip::ZipWriter::new(File::create(&path)?);
        let options = zip::write::SimpleFileOptions::default();
        writer.start_file("good.txt", options)?;
        writer.write_all(b"good")?;
        writer.start_file("../evil.txt", options)?;
        writer.write_all(b"evil")?;
        writer.finish()?;
    }

    let target = dir.path().join("target");
    let archive = ZipLayerArchive::new(&path);
    assert!(matches!(archive.unarchive_to(&target), Err(StoreError::InvalidArgument(_))));
    assert!(!target.join("good.txt").exists());
    assert!(!dir.path().join("evil.txt").exists());
    Ok(())
}

#[test]
fn test_tar_entry_outside_target_extracts_nothing() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("evil.tar");
    {
        let mut builder = tar::Builder::new(File::create(&path)?);

        let mut good = tar::Header::new_gnu();
        good.set_size(4);
        good.set_mode(0o644);
        good.set_entry_type(tar::EntryType::Regular);
        builder.append_data(&mut good, "good.txt", &b"good"[..])?;

        let name = b"../evil.txt";
        let mut evil = tar::Header::new_gnu();
        evil.as_gnu_mut().expect("gnu header").name[..name.len()].copy_from_slice(name);
        evil.set_size(4);
        evil.set_mode(0o644);
        evil.set_entry_type(tar::EntryType::Regular);
        evil.set_cksum();
        builder.append(&evil, &b"evil"[..])?;

        builder.finish()?;
    }

    let target = dir.path().join("target");
    let archive = TarLayerArchive::new(&path);
    assert!(matches!(archive.unarchive_to(&target), Err(StoreError::InvalidArgument(_))));
    assert!(!target.join("good.txt").exists());
    assert!(!dir.path().join("evil.txt").exists());
    Ok(())
}

#[test]
fn test_providers_list_archived_layers() -> Result<()> {
    let dir = TempDir::new()?;
    let staging = dir.path().join("staging");
    populate(&staging)?;

    let zip_root = dir.path().join("zip");
    let zips = ZipArchiveProvider::new(&zip_root)?;
    zips.create_archive(1700000000002)?.archive_from(&staging)?;
    zips.create_archive(1700000000001)?.archive_from(&staging)?;
    fs::write(zip_root.join("notes.txt"), b"ignored")?;
    assert_eq!(zips.list_archived_layers()?, vec![1700000000001, 1700000000002]);
    assert!(zips.exists(1700000000001)?);
    assert!(!zips.exists(1700000000003)?);
    assert!(zips.create_archive(1700000000002)?.is_archived());

    let tars = TarArchiveProvider::new(dir.path().join("tar"))?;
    assert!(tars.list_archived_layers()?.is_empty());
    tars.create_archive(1700000000005)?.archive_from(&staging)?;
    assert_eq!(tars.list_archived_layers()?, vec![1700000000005]);
    Ok(())
}

#[test]
fn test_provider_rejects_file_as_root() -> Result<()> {
    let dir = TempDir::new()?;
    let file = dir.path().join("file");
    fs::write(&file, b"x")?;
    assert!(matches!(ZipArchiveProvider::new(&file), Err(StoreError::InvalidArgument(_))));
    Ok(())
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn check_streamed_reads(archive: Box<dyn Archive>, staging: &Path) -> Result<()> {
    let big = patterned(3 * 1024 * 1024 + 17);
    let long_name = format!("{}/deep.bin", "d".repeat(120));
    fs::create_dir_all(staging.join("d".repeat(120)))?;
    fs::write(staging.join("big.bin"), &big)?;
    fs::write(staging.join(&long_name), b"deep")?;
    fs::write(staging.join("small.txt"), b"small")?;
    archive.archive_from(staging)?;

    let mut first = archive.read_file("big.bin")?;
    let mut second = archive.read_file("small.txt")?;
    let mut deep = archive.read_file(&long_name)?;
    drop(archive);

    let mut head = vec![0u8; 1000];
    first.read_exact(&mut head)?;
    let mut small = String::new();
    second.read_to_string(&mut small)?;
    let mut rest = Vec::new();
    first.read_to_end(&mut rest)?;
    head.extend(rest);
    let mut deep_content = Vec::new();
    deep.read_to_end(&mut deep_content)?;

    assert_eq!(small, "small");
    assert_eq!(head.len(), big.len());
    assert!(head == big);
    assert_eq!(deep_content, b"deep");
    Ok(())
}

#[test]
fn test_zip_entries_are_streamed() -> Result<()> {
    let dir = TempDir::new()?;
    let archive = ZipLayerArchive::new(dir.path().join("layer.zip"));
    check_streamed_reads(Box::new(archive), &dir.path().join("staging"))
}

#[test]
fn test_tar_entries_are_streamed() -> Result<()> {
    let dir = TempDir::new()?;
    let archive = TarLayerArchive::new(dir.path().join("layer.tar"));
    check_streamed_reads(Box::new(archive), &dir.path().join("staging"))
}

#[test]
fn test_zip_reads_stored_and_deflated_entries() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("mixed.zip");
    let data = patterned(70_000);
    {
        let mut writer = zip::ZipWriter::new(File::create(&path)?);
        let stored = zip::write::SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
        let deflated =
            zip::write::SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
        writer.start_file("stored.bin", stored)?;
        writer.write_all(&data)?;
        writer.start_file("deflated.bin", deflated)?;
        writer.write_all(&data)?;
        writer.finish()?;
    }

    let archive = ZipLayerArchive::new(&path);
    for name in ["stored.bin", "deflated.bin"] {
        let mut content = Vec::new();
        archive.read_file(name)?.read_to_end(&mut content)?;
        assert!(content == data, "content of {} differs", name);
    }
    Ok(())
}
