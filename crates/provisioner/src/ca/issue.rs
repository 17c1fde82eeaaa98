//! Certificate templates and signing for root and client identities.

use super::Identity;
use crate::{Error, Result};
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, PKeyRef, Private};
use openssl::rsa::Rsa;
use openssl::x509::extension::{
    AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAlternativeName,
    SubjectKeyIdentifier,
};
use openssl::x509::{X509Builder, X509NameBuilder, X509Name};
use std::net::IpAddr;

/// RSA modulus size for every generated key.
pub const KEY_BITS: u32 = 2048;

/// Serial numbers are drawn uniformly from `[0, 2^128)`.
pub const SERIAL_BITS: i32 = 128;

/// Fixed expiry shared by all issued certificates (2049-12-01 01:01:01 UTC).
///
/// Some TLS stacks reject validity beyond 2049, the last year UTCTime can
/// express.
pub const NOT_AFTER: &str = "20491201010101Z";

fn signing(e: ErrorStack) -> Error {
    Error::Signing(e.to_string())
}

fn key_generation(e: ErrorStack) -> Error {
    Error::KeyGeneration(e.to_string())
}

/// Generates a fresh RSA private key.
pub fn generate_key() -> Result<PKey<Private>> {
    let rsa = Rsa::generate(KEY_BITS).map_err(key_generation)?;
    PKey::from_rsa(rsa).map_err(key_generation)
}

fn random_serial() -> Result<openssl::asn1::Asn1Integer> {
    let mut serial = BigNum::new().map_err(key_generation)?;
    serial
        .rand(SERIAL_BITS, MsbOption::MAYBE_ZERO, false)
        .map_err(key_generation)?;
    serial.to_asn1_integer().map_err(key_generation)
}

fn subject(organization: &str, common_name: &str) -> Result<X509Name> {
    let mut name = X509NameBuilder::new().map_err(signing)?;
    name.append_entry_by_nid(Nid::ORGANIZATIONNAME, organization)
        .map_err(signing)?;
    name.append_entry_by_nid(Nid::COMMONNAME, common_name)
        .map_err(signing)?;
    Ok(name.build())
}

/// Fields shared by root and client certificates: v3, random serial,
/// validity from now until [`NOT_AFTER`], SHA-256 signatures.
fn template(name: &X509Name, key: &PKeyRef<Private>) -> Result<X509Builder> {
    let serial = random_serial()?;
    let not_before = Asn1Time::days_from_now(0).map_err(signing)?;
    let not_after = Asn1Time::from_str(NOT_AFTER).map_err(signing)?;

    let mut builder = X509Builder::new().map_err(signing)?;
    builder.set_version(2).map_err(signing)?;
    builder.set_serial_number(&serial).map_err(signing)?;
    builder.set_subject_name(name).map_err(signing)?;
    builder.set_pubkey(key).map_err(signing)?;
    builder.set_not_before(&not_before).map_err(signing)?;
    builder.set_not_after(&not_after).map_err(signing)?;
    Ok(builder)
}

/// Builds a self-signed CA identity valid for the given server addresses.
///
/// The certificate is marked CA, may sign certificates and digital
/// signatures, and is usable for both server and client authentication.
pub fn root_identity(organization: &str, server_ips: &[IpAddr]) -> Result<Identity> {
    let key = generate_key()?;
    let name = subject(organization, &format!("{} root", organization))?;

    let mut builder = template(&name, &key)?;
    builder.set_issuer_name(&name).map_err(signing)?;

    let basic = BasicConstraints::new()
        .critical()
        .ca()
        .build()
        .map_err(signing)?;
    builder.append_extension(basic).map_err(signing)?;

    let usage = KeyUsage::new()
        .critical()
        .key_cert_sign()
        .digital_signature()
        .build()
        .map_err(signing)?;
    builder.append_extension(usage).map_err(signing)?;

    let extended = ExtendedKeyUsage::new()
        .server_auth()
        .client_auth()
        .build()
        .map_err(signing)?;
    builder.append_extension(extended).map_err(signing)?;

    let ski = SubjectKeyIdentifier::new()
        .build(&builder.x509v3_context(None, None))
        .map_err(signing)?;
    builder.append_extension(ski).map_err(signing)?;

    if !server_ips.is_empty() {
        let mut san = SubjectAlternativeName::new();
        for ip in server_ips {
            san.ip(&ip.to_string());
        }
        let san = san
            .build(&builder.x509v3_context(None, None))
            .map_err(signing)?;
        builder.append_extension(san).map_err(signing)?;
    }

    builder
        .sign(&key, MessageDigest::sha256())
        .map_err(signing)?;

    Ok(Identity {
        certificate: builder.build(),
        private_key: key,
    })
}

/// Builds a client identity signed by `root`.
///
/// The certificate is not a CA, may only produce digital signatures and is
/// usable only for client authentication.
pub fn client_identity(organization: &str, label: &str, root: &Identity) -> Result<Identity> {
    let key = generate_key()?;
    let name = subject(organization, label)?;

    let mut builder = template(&name, &key)?;
    builder
        .set_issuer_name(root.certificate.subject_name())
        .map_err(signing)?;

    let basic = BasicConstraints::new().build().map_err(signing)?;
    builder.append_extension(basic).map_err(signing)?;

    let usage = KeyUsage::new()
        .critical()
        .digital_signature()
        .build()
        .map_err(signing)?;
    builder.append_extension(usage).map_err(signing)?;

    let extended = ExtendedKeyUsage::new()
        .client_auth()
        .build()
        .map_err(signing)?;
    builder.append_extension(extended).map_err(signing)?;

    let aki = AuthorityKeyIdentifier::new()
        .keyid(false)
        .build(&builder.x509v3_context(Some(&*root.certificate), None))
        .map_err(signing)?;
    builder.append_extension(aki).map_err(signing)?;

    builder
        .sign(&root.private_key, MessageDigest::sha256())
        .map_err(signing)?;

    Ok(Identity {
        certificate: builder.build(),
        private_key: key,
    })
}
