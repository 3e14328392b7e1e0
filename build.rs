fn main() {
    // Write build-time information, used in the run summary.
    built::write_built_file().expect("Failed to acquire build-time information");

    println!("cargo:rerun-if-changed=build.rs");
}
