//! Certificate authority and leaf cache behavior.

use snare::CertificateStore;
use std::collections::BTreeSet;
use std::sync::Arc;

fn init_tracing() {
  let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn temp_dir(tag: &str) -> std::path::PathBuf {
  let dir = std::env::temp_dir().join(format!("snare-ca-{}-{}", tag, std::process::id()));
  let _ = std::fs::remove_dir_all(&dir);
  dir
}

fn names(list: &[&str]) -> BTreeSet<String> {
  list.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn root_pair_is_generated_and_persisted() {
  init_tracing();
  let dir = temp_dir("root");
  let store = CertificateStore::new(&dir).await.unwrap();

  let pem = store.ca_cert_pem().unwrap();
  assert!(pem.contains("BEGIN CERTIFICATE"));
  assert!(store.ca_cert_path().exists());
  assert!(dir.join("ca_key.pem").exists());

  #[cfg(unix)]
  {
    use std::os::unix::fs::PermissionsExt;
    let mode = std::fs::metadata(dir.join("ca_key.pem"))
      .unwrap()
      .permissions()
      .mode();
    assert_eq!(mode & 0o777, 0o600, "root key must not be world-readable");
  }

  // A second store over the same directory loads the same root.
  let reloaded = CertificateStore::new(&dir).await.unwrap();
  assert_eq!(reloaded.ca_cert_pem().unwrap(), pem);

  std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn minted_leaves_cover_the_requested_names() {
  init_tracing();
  let dir = temp_dir("sans");
  let store = CertificateStore::new(&dir).await.unwrap();

  let requested = names(&["example.test", "alt.example.test"]);
  let (chain, _key) = store.leaf_for("example.test", &requested).await.unwrap();
  assert_eq!(chain.len(), 2, "chain should be [leaf, root]");

  let (_, leaf) = x509_parser::parse_x509_certificate(chain[0].as_ref()).unwrap();
  let san = leaf
    .subject_alternative_name()
    .unwrap()
    .expect("leaf must carry a SAN extension");
  let mut dns_names: Vec<String> = san
    .value
    .general_names
    .iter()
    .filter_map(|name| match name {
      x509_parser::extensions::GeneralName::DNSName(dns) => Some((*dns).to_string()),
      _ => None,
    })
    .collect();
  dns_names.sort();
  assert_eq!(dns_names, vec!["alt.example.test", "example.test"]);

  let cn = leaf
    .subject()
    .iter_common_name()
    .next()
    .unwrap()
    .as_str()
    .unwrap();
  assert_eq!(cn, "example.test");

  std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn cache_hits_return_the_same_leaf() {
  init_tracing();
  let dir = temp_dir("cache");
  let store = CertificateStore::new(&dir).await.unwrap();

  let set = names(&["cached.test"]);
  let (first, _) = store.leaf_for("cached.test", &set).await.unwrap();
  let (second, _) = store.leaf_for("cached.test", &set).await.unwrap();
  // Serial numbers are random per mint, so identical DER means one mint.
  assert_eq!(first[0], second[0]);

  // A different name set misses and mints a distinct leaf.
  let other = names(&["cached.test", "extra.test"]);
  let (third, _) = store.leaf_for("cached.test", &other).await.unwrap();
  assert_ne!(first[0], third[0]);

  std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn concurrent_misses_collapse_to_one_mint() {
  init_tracing();
  let dir = temp_dir("singleflight");
  let store = Arc::new(CertificateStore::new(&dir).await.unwrap());

  let mut tasks = Vec::new();
  for _ in 0..16 {
    let store = store.clone();
    tasks.push(tokio::spawn(async move {
      let set = names(&["flight.test"]);
      let (chain, _) = store.leaf_for("flight.test", &set).await.unwrap();
      chain[0].clone()
    }));
  }
  let mut leaves = Vec::new();
  for task in tasks {
    leaves.push(task.await.unwrap());
  }
  for leaf in &leaves[1..] {
    assert_eq!(leaf, &leaves[0], "every caller must see the single mint");
  }

  std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn ip_names_get_ip_sans() {
  init_tracing();
  let dir = temp_dir("ip");
  let store = CertificateStore::new(&dir).await.unwrap();

  let set = names(&["127.0.0.1"]);
  let (chain, _) = store.leaf_for("127.0.0.1", &set).await.unwrap();
  let (_, leaf) = x509_parser::parse_x509_certificate(chain[0].as_ref()).unwrap();
  let san = leaf.subject_alternative_name().unwrap().unwrap();
  let has_ip = san
    .value
    .general_names
    .iter()
    .any(|name| matches!(name, x509_parser::extensions::GeneralName::IPAddress(bytes) if bytes == &[127, 0, 0, 1]));
  assert!(has_ip, "IP literal targets need an iPAddress SAN");

  std::fs::remove_dir_all(&dir).ok();
}
