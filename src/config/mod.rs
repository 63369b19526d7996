//! TOML configuration: the registration command file and the proton dose
//! parameters.
//!
//! Physical quantities are written with their units (`"2.5 mm"`), and
//! parsed by `uom`. A bare number would be silently interpreted in the
//! quantity's base unit (metres!), so the `deserialize_uom*` helpers insist
//! on strings.

pub mod dose;
pub mod registration;

use std::str::FromStr;

use serde::{Deserialize, Deserializer, de};

use units::{mm_, Length};

pub(crate) fn deserialize_uom<'d, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'d>,
    T: FromStr,
    <T as FromStr>::Err: std::fmt::Display,
{
    String::deserialize(deserializer)?
        .parse::<T>()
        .map_err(de::Error::custom)
}

pub(crate) fn deserialize_uom_opt<'d, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'d>,
    T: FromStr,
    <T as FromStr>::Err: std::fmt::Display,
{
    Option::<String>::deserialize(deserializer)?
        .map(|s| s.parse::<T>())
        .transpose()
        .map_err(de::Error::custom)
}

pub(crate) fn deserialize_uom_3d_opt<'d, D, T>(deserializer: D) -> Result<Option<[T; 3]>, D::Error>
where
    D: Deserializer<'d>,
    T: FromStr,
    <T as FromStr>::Err: std::fmt::Display,
{
    Option::<[String; 3]>::deserialize(deserializer)?
        .map(|[x, y, z]| tr_arr_res([x.parse(), y.parse(), z.parse()]))
        .transpose()
        .map_err(de::Error::custom)
}

pub(crate) fn deserialize_uom_3d<'d, D, T>(deserializer: D) -> Result<[T; 3], D::Error>
where
    D: Deserializer<'d>,
    T: FromStr,
    <T as FromStr>::Err: std::fmt::Display,
{
    let [x, y, z] = <[String; 3]>::deserialize(deserializer)?;
    tr_arr_res([x.parse(), y.parse(), z.parse()]).map_err(de::Error::custom)
}

pub(crate) fn deserialize_uom_vec<'d, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'d>,
    T: FromStr,
    <T as FromStr>::Err: std::fmt::Display,
{
    Vec::<String>::deserialize(deserializer)?
        .iter()
        .map(|s| s.parse::<T>())
        .collect::<Result<_, _>>()
        .map_err(de::Error::custom)
}

/// Transpose an array of 3 `Result`s
///
/// `Ok` if all elements are `Ok`; otherwise the first `Err`.
fn tr_arr_res<O, E>([x, y, z]: [Result<O, E>; 3]) -> Result<[O; 3], E> {
    Ok([x?, y?, z?])
}

/// Lengths in mm, as used by the numerical core
pub(crate) fn mm3(lengths: [Length; 3]) -> [f64; 3] { lengths.map(mm_) }

#[cfg(test)]
mod tests {
    use super::*;
    use units::{cm, mm, Length};
    #[allow(unused)] use pretty_assertions::{assert_eq, assert_ne};

    #[derive(Deserialize, Debug)]
    struct X {
        #[serde(deserialize_with = "deserialize_uom")]
        a: Length,
        #[serde(default, deserialize_with = "deserialize_uom_opt")]
        b: Option<Length>,
        #[serde(default, deserialize_with = "deserialize_uom_3d_opt")]
        c: Option<[Length; 3]>,
    }

    #[test]
    fn lengths_need_units() {
        let x: X = toml::from_str(r#"a = "2 cm""#).unwrap();
        assert_eq!(x.a, cm(2.0));
        assert_eq!(x.b, None);
        assert_eq!(x.c, None);
        assert!(toml::from_str::<X>("a = 2").is_err());
    }

    #[test]
    fn length_triplets() {
        let x: X = toml::from_str(r#"
              a = "1 mm"
              b = "3 mm"
              c = ["1 mm", "2.5 mm", "1 cm"]
        "#).unwrap();
        assert_eq!(x.b, Some(mm(3.0)));
        float_eq::assert_float_eq!(mm3(x.c.unwrap()), [1.0, 2.5, 10.0], rmax_all <= 1e-12);
    }

    #[test]
    fn first_bad_element_is_reported() {
        let err = toml::from_str::<X>(r#"
              a = "1 mm"
              c = ["1 mm", "two mm", "1 parsec"]
        "#).unwrap_err();
        assert!(err.to_string().contains("c"));
    }
}
