//! Magic bit patterns bounding files, sections and key/value pairs.
//!
//! Patterns are chosen to be unlikely in real payloads so a reader that lost
//! its position can be told apart from one that is in sync.

use super::Word;

/// Opens a serialized file
pub const BEGIN_FILE: [Word; 8] = [
    0x1111_1111_1111_1111,
    0x1111_CCCC_CCCC_1111,
    0x1111_CCCC_CCCC_1111,
    0x1111_1111_1111_1111,
    0xf39d_af3a_2eb8_c063,
    0x3267_6f8d_90e8_2356,
    0xFFFF_FFFF_FFFF_FFFF,
    0xFFFF_FFFF_FFFF_FFFF,
];

/// Closes a serialized file
pub const END_FILE: [Word; 8] = [
    0xFFFF_FFFF_FFFF_FFFF,
    0xFFFF_FFFF_FFFF_FFFF,
    0x809b_feeb_4ce2_6bfc,
    0xcde7_2807_b24f_3a83,
    0,
    0x0000_CCCC_CCCC_0000,
    0x0000_CCCC_CCCC_0000,
    0,
];

/// Opens a named section
pub const BEGIN_SECTION: [Word; 4] = [
    0x1111_1111_1111_1111,
    0x0000_BBBB_BBBB_0000,
    0x1111_1111_1111_1111,
    0xFFFF_FFFF_FFFF_FFFF,
];

/// Closes a section
pub const END_SECTION: [Word; 4] = [
    0xFFFF_FFFF_FFFF_FFFF,
    0,
    0x0000_EEEE_EEEE_0000,
    0,
];

/// Precedes the key string of a key/value pair
pub const KEY_FOLLOWS: Word = 0x0000_1111_0000_0000;

/// Precedes the value string of a key/value pair
pub const VALUE_FOLLOWS: Word = 0x0000_2222_0000_0000;

/// Terminates a key/value pair
pub const END_KEY_VALUE: Word = 0x0000_EEEE_0000_0000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delimiters_are_distinct() {
        assert_ne!(BEGIN_FILE, END_FILE);
        assert_ne!(BEGIN_SECTION, END_SECTION);
        assert_ne!(&BEGIN_FILE[..4], &BEGIN_SECTION[..]);
        let sentinels = [KEY_FOLLOWS, VALUE_FOLLOWS, END_KEY_VALUE];
        for (i, a) in sentinels.iter().enumerate() {
            for b in &sentinels[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
