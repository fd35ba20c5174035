//! Link negotiation and authentication.
//!
//! Runs on the raw stream before any framing: magic/version exchange,
//! capability reconciliation, then the pre-shared ticket encrypted with
//! RSA-OAEP/SHA-1 under the server's public key.

use rsa::pkcs8::DecodePublicKey;
use rsa::{Oaep, RsaPublicKey};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::caps::caps;
use crate::error::{LinkError, SpiceError};
use crate::proto::{
    Channel, SPICE_COMMON_CAP_MINI_HEADER, SPICE_MAGIC, SPICE_TICKET_PUBKEY_BYTES,
    SPICE_VERSION_MAJOR, SPICE_VERSION_MINOR,
};

/// Everything negotiated for one channel link.
#[derive(Debug, Clone)]
pub struct LinkSession {
    pub kind: Channel,
    pub id: u8,
    /// Protocol version announced by the server.
    pub major: u32,
    pub minor: u32,
    pub common_caps: Vec<u32>,
    pub channel_caps: Vec<u32>,
    /// Intersection of requested and offered channel caps.
    pub valid_caps: Vec<u32>,
    /// Both sides agreed on 6-byte headers.
    pub mini_headers: bool,
}

impl LinkSession {
    /// A session with nothing negotiated, mini headers on. Useful when
    /// driving a [`crate::connection::Connection`] over a test pipe.
    pub fn plain(kind: Channel, id: u8) -> Self {
        LinkSession {
            kind,
            id,
            major: SPICE_VERSION_MAJOR,
            minor: SPICE_VERSION_MINOR,
            common_caps: Vec::new(),
            channel_caps: Vec::new(),
            valid_caps: Vec::new(),
            mini_headers: true,
        }
    }
}

/// Run the full handshake for one channel: link packet, reply,
/// OAEP-encrypted ticket, final error word.
pub async fn handshake<S>(
    stream: &mut S,
    session_id: u32,
    kind: Channel,
    id: u8,
    channel_caps: &[u32],
    password: &str,
) -> Result<LinkSession, SpiceError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    send_link_mess(stream, session_id, kind, id, channel_caps).await?;
    let (mut session, public_key) = read_link_reply(stream, kind, id).await?;

    let cnt = session.channel_caps.len().min(channel_caps.len());
    session.valid_caps = (0..cnt)
        .map(|i| channel_caps[i] & session.channel_caps[i])
        .collect();
    debug!(
        channel = %kind, id,
        req_caps = ?channel_caps,
        caps = ?session.channel_caps,
        valid_caps = ?session.valid_caps,
        "channel capabilities negotiated"
    );

    let ciphertext = public_key
        .encrypt(
            &mut rand::thread_rng(),
            Oaep::new::<sha1::Sha1>(),
            password.as_bytes(),
        )
        .map_err(|e| SpiceError::TicketEncryption(e.to_string()))?;
    stream.write_all(&ciphertext).await?;

    let mut err = [0u8; 4];
    stream.read_exact(&mut err).await?;
    LinkError::check(u32::from_le_bytes(err))?;

    Ok(session)
}

async fn send_link_mess<S>(
    stream: &mut S,
    session_id: u32,
    kind: Channel,
    id: u8,
    channel_caps: &[u32],
) -> Result<(), SpiceError>
where
    S: AsyncWrite + Unpin,
{
    let common_caps = caps(&[SPICE_COMMON_CAP_MINI_HEADER]);

    let mut body = Vec::new();
    body.extend_from_slice(&session_id.to_le_bytes());
    body.push(kind as u8);
    body.push(id);
    body.extend_from_slice(&(common_caps.len() as u32).to_le_bytes());
    body.extend_from_slice(&(channel_caps.len() as u32).to_le_bytes());
    body.extend_from_slice(&18u32.to_le_bytes()); // caps offset
    for c in &common_caps {
        body.extend_from_slice(&c.to_le_bytes());
    }
    for c in channel_caps {
        body.extend_from_slice(&c.to_le_bytes());
    }

    let mut pkt = Vec::with_capacity(16 + body.len());
    pkt.extend_from_slice(SPICE_MAGIC);
    pkt.extend_from_slice(&SPICE_VERSION_MAJOR.to_le_bytes());
    pkt.extend_from_slice(&SPICE_VERSION_MINOR.to_le_bytes());
    pkt.extend_from_slice(&(body.len() as u32).to_le_bytes());
    pkt.extend_from_slice(&body);

    stream.write_all(&pkt).await?;
    Ok(())
}

async fn read_link_reply<S>(
    stream: &mut S,
    kind: Channel,
    id: u8,
) -> Result<(LinkSession, RsaPublicKey), SpiceError>
where
    S: AsyncRead + Unpin,
{
    let mut hdr = [0u8; 16];
    stream.read_exact(&mut hdr).await?;

    if &hdr[..4] != SPICE_MAGIC {
        return Err(SpiceError::InvalidMagic);
    }
    let major = u32::from_le_bytes(hdr[4..8].try_into().unwrap_or_default());
    let minor = u32::from_le_bytes(hdr[8..12].try_into().unwrap_or_default());
    let size = u32::from_le_bytes(hdr[12..16].try_into().unwrap_or_default());

    if size > 512 {
        return Err(SpiceError::LinkReplyTooLarge(size));
    }

    let mut body = vec![0u8; size as usize];
    stream.read_exact(&mut body).await?;

    let mut r = crate::primitives::WireReader::new(&body, "link reply");
    LinkError::check(r.u32()?)?;

    // 1024-bit RSA public key in X.509 SubjectPublicKeyInfo format
    let key_der = r.take(SPICE_TICKET_PUBKEY_BYTES)?;
    let public_key = RsaPublicKey::from_public_key_der(key_der)
        .map_err(|e| SpiceError::InvalidPublicKey(e.to_string()))?;

    let num_common = r.u32()?;
    let num_channel = r.u32()?;
    let _caps_offset = r.u32()?;

    let mut common_caps = Vec::with_capacity(num_common.min(64) as usize);
    for _ in 0..num_common {
        common_caps.push(r.u32()?);
    }
    let mut channel_caps = Vec::with_capacity(num_channel.min(64) as usize);
    for _ in 0..num_channel {
        channel_caps.push(r.u32()?);
    }

    let mini_headers = common_caps
        .first()
        .map(|w| w & (1 << SPICE_COMMON_CAP_MINI_HEADER) != 0)
        .unwrap_or(false);

    Ok((
        LinkSession {
            kind,
            id,
            major,
            minor,
            common_caps,
            channel_caps,
            valid_caps: Vec::new(),
            mini_headers,
        },
        public_key,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs8::EncodePublicKey;
    use rsa::RsaPrivateKey;

    fn spki_der(key: &RsaPrivateKey) -> Vec<u8> {
        key.to_public_key()
            .to_public_key_der()
            .expect("encode public key")
            .as_bytes()
            .to_vec()
    }

    fn link_reply(error: u32, key_der: &[u8], common: &[u32], channel: &[u32]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&error.to_le_bytes());
        body.extend_from_slice(key_der);
        body.resize(4 + SPICE_TICKET_PUBKEY_BYTES, 0);
        body.extend_from_slice(&(common.len() as u32).to_le_bytes());
        body.extend_from_slice(&(channel.len() as u32).to_le_bytes());
        body.extend_from_slice(&178u32.to_le_bytes());
        for c in common.iter().chain(channel) {
            body.extend_from_slice(&c.to_le_bytes());
        }

        let mut pkt = Vec::new();
        pkt.extend_from_slice(SPICE_MAGIC);
        pkt.extend_from_slice(&SPICE_VERSION_MAJOR.to_le_bytes());
        pkt.extend_from_slice(&SPICE_VERSION_MINOR.to_le_bytes());
        pkt.extend_from_slice(&(body.len() as u32).to_le_bytes());
        pkt.extend_from_slice(&body);
        pkt
    }

    #[tokio::test]
    async fn handshake_negotiates_and_authenticates() {
        let key = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).expect("generate key");
        let der = spki_der(&key);
        assert_eq!(der.len(), SPICE_TICKET_PUBKEY_BYTES);

        let (mut client, mut server) = tokio::io::duplex(16 * 1024);

        let server_task = tokio::spawn(async move {
            // client link packet: header + body
            let mut hdr = [0u8; 16];
            server.read_exact(&mut hdr).await.unwrap();
            assert_eq!(&hdr[..4], SPICE_MAGIC);
            let size = u32::from_le_bytes(hdr[12..16].try_into().unwrap());
            let mut body = vec![0u8; size as usize];
            server.read_exact(&mut body).await.unwrap();
            assert_eq!(body[4], Channel::Inputs as u8); // channel kind
            assert_eq!(body[5], 0); // channel id

            let reply = link_reply(0, &der, &[0b1], &[0b110]);
            server.write_all(&reply).await.unwrap();

            // encrypted ticket: 128 bytes for a 1024-bit key
            let mut ticket = vec![0u8; 128];
            server.read_exact(&mut ticket).await.unwrap();
            let plain = key
                .decrypt(Oaep::new::<sha1::Sha1>(), &ticket)
                .expect("decrypt ticket");
            assert_eq!(plain, b"hunter2");

            server.write_all(&0u32.to_le_bytes()).await.unwrap();
        });

        let session = handshake(&mut client, 0, Channel::Inputs, 0, &[0b010], "hunter2")
            .await
            .expect("handshake");

        assert!(session.mini_headers);
        assert_eq!(session.valid_caps, vec![0b010]);
        assert_eq!(session.major, SPICE_VERSION_MAJOR);
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn handshake_rejects_error_code() {
        let key = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).expect("generate key");
        let der = spki_der(&key);

        let (mut client, mut server) = tokio::io::duplex(16 * 1024);

        tokio::spawn(async move {
            let mut hdr = [0u8; 16];
            server.read_exact(&mut hdr).await.unwrap();
            let size = u32::from_le_bytes(hdr[12..16].try_into().unwrap());
            let mut body = vec![0u8; size as usize];
            server.read_exact(&mut body).await.unwrap();

            // permission denied
            let reply = link_reply(7, &der, &[], &[]);
            server.write_all(&reply).await.unwrap();
        });

        let err = handshake(&mut client, 0, Channel::Main, 0, &[], "pw")
            .await
            .unwrap_err();
        assert!(matches!(err, SpiceError::Link(LinkError::PermissionDenied)));
    }

    #[tokio::test]
    async fn handshake_rejects_bad_magic() {
        let (mut client, mut server) = tokio::io::duplex(16 * 1024);

        tokio::spawn(async move {
            let mut hdr = [0u8; 16];
            server.read_exact(&mut hdr).await.unwrap();
            let size = u32::from_le_bytes(hdr[12..16].try_into().unwrap());
            let mut body = vec![0u8; size as usize];
            server.read_exact(&mut body).await.unwrap();
            server.write_all(b"NOPE").await.unwrap();
            server.write_all(&[0u8; 12]).await.unwrap();
        });

        let err = handshake(&mut client, 0, Channel::Main, 0, &[], "pw")
            .await
            .unwrap_err();
        assert!(matches!(err, SpiceError::InvalidMagic));
    }
}
