use anyhow::{Context, Result};
use qrcode::QrCode;

/// Render the device-link pairing URI as a terminal QR code for scanning.
pub fn display_pairing_qr(pairing_uri: &str) -> Result<()> {
    let code = QrCode::new(pairing_uri.as_bytes()).context("Failed to generate QR code")?;

    let string = code
        .render::<char>()
        .quiet_zone(false)
        .module_dimensions(2, 1)
        .build();

    println!("\n{}", string);
    println!("\nPairing URI:");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("{}", pairing_uri);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\n");

    Ok(())
}
