use proptest::prelude::*;
use spark_rpc_transport::{
    hash::{HASH_SEED, hash_add_str},
    options::{quote_if_needed, split_options},
    properties::Properties,
};

proptest! {
    /// 主机名经过引号处理后总能被原样拆分回来。
    #[test]
    fn quoted_hosts_split_back(host in "[a-zA-Z0-9.:_-]{1,40}") {
        prop_assume!(!host.starts_with('-'));
        let text = format!("ssl -h {} -p 10", quote_if_needed(&host));
        let args = split_options(&text).unwrap();
        prop_assert_eq!(args, vec!["ssl".to_owned(), "-h".to_owned(), host, "-p".to_owned(), "10".to_owned()]);
    }

    #[test]
    fn string_hash_is_stable(value in ".{0,64}") {
        prop_assert_eq!(hash_add_str(HASH_SEED, &value), hash_add_str(HASH_SEED, &value));
    }

    /// 属性文本中键值两侧的空白不影响结果。
    #[test]
    fn properties_trim_whitespace(key in "[A-Za-z][A-Za-z.]{0,20}", value in "[A-Za-z0-9]{1,20}") {
        let mut props = Properties::new();
        props.load_str(&format!("  {key}  =   {value}  \n")).unwrap();
        prop_assert_eq!(props.get_property(&key), Some(value.as_str()));
    }
}
