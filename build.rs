//! Build script for dbgate
//!
//! Embeds build-time information (git commit, dirty status, build timestamp)
//! shown by `dbgate --version`.

fn main() {
    // Re-run build if the packager overrides the default nft binary
    println!("cargo:rerun-if-env-changed=DBGATE_SYSTEM_NFT_PATH");

    shadow_rs::ShadowBuilder::builder()
        .build()
        .expect("Failed to generate build info");
}
