use tempfile::TempDir;

pub fn setup() -> TempDir {
    strata_db::test_utils::init_log();
    tempfile::tempdir().unwrap()
}
