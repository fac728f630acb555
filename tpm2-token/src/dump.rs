use std::io::Write;

use crate::record::{pcr_numbers, Tpm2Token};

/// Hex characters of the nonce printed per line.
const NONCE_LINE: usize = 32;

pub fn dump(token: &Tpm2Token, out: &mut dyn Write) -> std::io::Result<()> {
    writeln!(
        out,
        "\tTPM Token version:\t{}.{}",
        token.version_major, token.version_minor
    )?;
    writeln!(out, "\tPassphrase NVindex:\t0x{:08x}", token.nv_index)?;
    writeln!(out, "\tPassphrase size:\t{} [bytes]", token.key_size)?;
    writeln!(
        out,
        "\tIdentification nonce NVindex:\t0x{:08x}",
        token.nonce_nv_index
    )?;

    write!(out, "\tIdentification NV Nonce:\t")?;
    let nonce = token.nonce.as_bytes();
    for (i, pair) in nonce.chunks_exact(2).enumerate() {
        let offset = i * 2;
        if offset > 0 && offset % NONCE_LINE == 0 {
            write!(out, "\n\t                        \t")?;
        }
        if offset % NONCE_LINE != 0 {
            write!(out, " ")?;
        }
        out.write_all(pair)?;
    }
    writeln!(out)?;

    let pcrs: Vec<String> = pcr_numbers(token.pcrs)
        .iter()
        .map(u32::to_string)
        .collect();
    writeln!(out, "\tPCRs:     {}", pcrs.join(","))?;
    writeln!(out, "\tPCRBanks: {}", token.pcr_banks)?;

    let mut flags = Vec::new();
    if token.da_protect {
        flags.push("DA_PROTECT");
    }
    if token.pin {
        flags.push("PIN");
    }
    writeln!(out, "\tflags:    {}", flags.join(","))
}
