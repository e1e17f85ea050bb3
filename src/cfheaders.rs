use bitcoin::{
    bip158::FilterHeader,
    hashes::{sha256d, Hash},
};

/// Filter header for `raw_filter` chained onto `prev` (BIP-157):
///
///   F_n = HASH256(raw_filter)
///   H_n = HASH256( F_n || H_{n-1} )
pub fn next_filter_header(raw_filter: &[u8], prev: &FilterHeader) -> FilterHeader {
    let filter_hash = sha256d::Hash::hash(raw_filter);

    let mut data = Vec::with_capacity(64);
    data.extend_from_slice(filter_hash.as_ref()); // F_n
    data.extend_from_slice(prev.as_ref()); // H_{n-1}
    FilterHeader::from_byte_array(sha256d::Hash::hash(&data).to_byte_array())
}

/// Whether `raw_filter` is the filter committed to by `committed`, given the
/// previous block's filter header.
pub fn verify_filter(raw_filter: &[u8], prev: &FilterHeader, committed: &FilterHeader) -> bool {
    &next_filter_header(raw_filter, prev) == committed
}
