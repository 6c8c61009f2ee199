fn main() {
    built::write_built_file().expect("Failed to acquire build-time information");

    // Release builds may pin the revision instead of relying on a .git checkout
    println!("cargo:rerun-if-env-changed=CODEBOT_GIT_HASH");
    if let Ok(hash) = std::env::var("CODEBOT_GIT_HASH") {
        println!("cargo:rustc-env=CODEBOT_GIT_HASH={}", hash);
    }
}
