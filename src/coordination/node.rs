/// Generate a node identifier: `<hostname>-<random-8-chars>`, unique per
/// call so that several processes on one host never share an identity.
pub fn node_id() -> String {
    let hostname = gethostname::gethostname().to_string_lossy().into_owned();
    let suffix = &uuid::Uuid::new_v4().simple().to_string()[..8];
    format!("{hostname}-{suffix}")
}
