fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_build::configure().compile(&["proto/store/v1/store.proto"], &["proto/store/v1"])?;
    Ok(())
}
